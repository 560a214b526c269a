use std::path::PathBuf;
use std::pin::pin;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fathom_adapters::HttpAdapterFactory;
use fathom_core::adapter::{AdapterFactory, AdapterRegistry, ProbeStatus};
use fathom_core::health::HealthGate;
use fathom_core::item::{ItemFilter, ItemKind, ItemState, MediaRequest};
use fathom_core::scheduler::{Pipeline, PipelineConfig};
use fathom_core::settings::{Settings, SettingsManager};
use fathom_core::store::{DEFAULT_PAGE_SIZE, EventedStore, ItemStore, list_items};
use fathom_db::{Database, DatabaseConfig, ItemBackend};

#[derive(Parser)]
#[command(name = "fathom", version, about = "Media acquisition pipeline")]
struct Cli {
    /// Settings document shared with the server
    #[arg(
        long,
        global = true,
        env = "FATHOM_SETTINGS_PATH",
        default_value = "data/settings.json"
    )]
    settings: PathBuf,

    /// PostgreSQL connection string
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[arg(long, global = true, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RequestKind {
    Movie,
    Show,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a movie or a show
    Request {
        /// IMDb id, e.g. tt0133093
        imdb_id: String,

        #[arg(short, long, value_enum, default_value = "movie")]
        kind: RequestKind,

        #[arg(short, long)]
        title: String,

        #[arg(short, long)]
        year: Option<i32>,

        /// Season and episodes, e.g. `1:1-7` or `2:1,2,5`. Repeatable.
        #[arg(short, long = "season", value_parser = parse_season)]
        seasons: Vec<(u32, Vec<u32>)>,
    },

    /// List items
    Items {
        /// Comma-separated states to include
        #[arg(short, long)]
        state: Option<String>,

        #[arg(short, long)]
        kind: Option<String>,

        /// Only children of this item
        #[arg(short, long)]
        parent: Option<String>,

        /// Emit newline-delimited JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print one item as JSON
    Show { id: String },

    /// Send an ERROR or SCRAPED_NOT_FOUND item back into the pipeline
    Retry { id: String },

    /// Remove an item
    Remove {
        id: String,

        /// Remove its seasons and episodes too
        #[arg(long, default_value_t = false)]
        cascade: bool,
    },

    /// Probe every configured service
    Probe,

    /// Run the pipeline without the HTTP API
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("fathom=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = SettingsManager::load_or_init(&cli.settings)
        .with_context(|| format!("Failed to load settings from {}", cli.settings.display()))?;

    match cli.command {
        Commands::Probe => cmd_probe(&settings.active()).await,
        Commands::Request {
            imdb_id,
            kind,
            title,
            year,
            seasons,
        } => {
            let request = media_request(imdb_id, kind, title, year, seasons);
            let pipeline = connect_pipeline(&cli.database_url, cli.max_connections, &settings).await?;
            cmd_request(&pipeline, request).await
        }
        Commands::Items {
            state,
            kind,
            parent,
            json,
        } => {
            let filter = item_filter(state, kind, parent)?;
            let pipeline = connect_pipeline(&cli.database_url, cli.max_connections, &settings).await?;
            cmd_items(pipeline.store(), filter, json).await
        }
        Commands::Show { id } => {
            let pipeline = connect_pipeline(&cli.database_url, cli.max_connections, &settings).await?;
            let item = pipeline
                .store()
                .get(&id)
                .await?
                .with_context(|| format!("Item not found: {id}"))?;
            println!("{}", serde_json::to_string_pretty(&item)?);
            Ok(())
        }
        Commands::Retry { id } => {
            let pipeline = connect_pipeline(&cli.database_url, cli.max_connections, &settings).await?;
            let item = pipeline.retry(&id).await?;
            println!("{} -> {}", item.id, item.state);
            Ok(())
        }
        Commands::Remove { id, cascade } => {
            let pipeline = connect_pipeline(&cli.database_url, cli.max_connections, &settings).await?;
            for removed in pipeline.remove(&id, cascade).await? {
                println!("removed {removed}");
            }
            Ok(())
        }
        Commands::Run => {
            let pipeline = connect_pipeline(&cli.database_url, cli.max_connections, &settings).await?;
            cmd_run(pipeline).await
        }
    }
}

/// Parses `N:1-7`, `N:1,2,5`, or a mix like `N:1-3,8`.
fn parse_season(raw: &str) -> Result<(u32, Vec<u32>), String> {
    let (season, episodes) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected SEASON:EPISODES, got '{raw}'"))?;
    let season: u32 = season
        .trim()
        .parse()
        .map_err(|_| format!("invalid season number '{season}'"))?;

    let mut numbers = Vec::new();
    for part in episodes.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parse = |s: &str| {
            s.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid episode number '{s}'"))
        };
        match part.split_once('-') {
            Some((from, to)) => {
                let (from, to) = (parse(from)?, parse(to)?);
                if from > to {
                    return Err(format!("empty episode range '{part}'"));
                }
                numbers.extend(from..=to);
            }
            None => numbers.push(parse(part)?),
        }
    }
    if numbers.is_empty() {
        return Err(format!("season {season} lists no episodes"));
    }
    numbers.sort_unstable();
    numbers.dedup();
    Ok((season, numbers))
}

fn media_request(
    imdb_id: String,
    kind: RequestKind,
    title: String,
    year: Option<i32>,
    seasons: Vec<(u32, Vec<u32>)>,
) -> MediaRequest {
    match kind {
        RequestKind::Movie => MediaRequest::movie(imdb_id, title, year),
        RequestKind::Show => seasons
            .into_iter()
            .fold(MediaRequest::show(imdb_id, title, year), |req, (n, eps)| {
                req.with_season(n, eps)
            }),
    }
}

fn item_filter(
    state: Option<String>,
    kind: Option<String>,
    parent: Option<String>,
) -> Result<ItemFilter> {
    let mut filter = ItemFilter::all();
    if let Some(states) = state {
        let states = states
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<ItemState>().map_err(anyhow::Error::msg))
            .collect::<Result<Vec<_>>>()?;
        filter = filter.with_states(states);
    }
    if let Some(kind) = kind {
        filter = filter.with_kind(kind.parse::<ItemKind>().map_err(anyhow::Error::msg)?);
    }
    filter.parent = parent;
    Ok(filter)
}

/// Builds a pipeline over PostgreSQL. Item commands always need the database,
/// since the in-memory store would vanish with the process.
async fn connect_pipeline(
    database_url: &Option<String>,
    max_connections: u32,
    settings: &SettingsManager,
) -> Result<Pipeline<ItemBackend>> {
    let Some(url) = database_url.as_ref().filter(|u| !u.trim().is_empty()) else {
        bail!("DATABASE_URL not set. Required for item commands.");
    };
    if max_connections == 0 {
        bail!("DATABASE_MAX_CONNECTIONS must be at least 1");
    }
    let config = DatabaseConfig {
        url: url.clone(),
        max_connections,
    };
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;

    let active = settings.active();
    let registry = AdapterRegistry::new(HttpAdapterFactory::new().build_all(&active)?);
    let health = HealthGate::new(
        std::time::Duration::from_secs(active.general.probe_ttl_secs.max(1)),
        active.probe_timeout(),
    );
    Ok(Pipeline::new(
        EventedStore::new(ItemBackend::from(db.item_repo())),
        registry,
        health,
        PipelineConfig::from_settings(&active),
    ))
}

async fn cmd_request(pipeline: &Pipeline<ItemBackend>, request: MediaRequest) -> Result<()> {
    let items = pipeline.intake(request).await?;
    for item in &items {
        println!("{:<24} {:<8} {}", item.id, item.kind, item.state);
    }
    tracing::info!(
        count = items.len(),
        "Stored; a running server or `fathom run` picks them up on its next sweep"
    );
    Ok(())
}

async fn cmd_items(store: &EventedStore<ItemBackend>, filter: ItemFilter, json: bool) -> Result<()> {
    let mut items = pin!(list_items(store.clone(), filter, DEFAULT_PAGE_SIZE));
    let mut total = 0usize;
    while let Some(item) = items.next().await {
        let projection = item?.projection();
        if json {
            println!("{}", serde_json::to_string(&projection)?);
        } else {
            println!(
                "{:<24} {:<8} {:<22} {} ({})",
                projection.id,
                projection.kind,
                projection.state,
                projection.title,
                projection.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            );
        }
        total += 1;
    }
    if !json {
        println!("\nTotal: {total} items");
    }
    Ok(())
}

async fn cmd_probe(settings: &Settings) -> Result<()> {
    let set = HttpAdapterFactory::new().build_all(settings)?;
    let adapters = set.all();
    if adapters.is_empty() {
        println!("No services configured");
        return Ok(());
    }

    let timeout = settings.probe_timeout();
    let results = futures::future::join_all(adapters.iter().map(|a| a.probe_within(timeout))).await;

    let mut failed = 0;
    for (adapter, status) in adapters.iter().zip(&results) {
        if !matches!(status, ProbeStatus::Ok) {
            failed += 1;
        }
        println!("  {:<14} {status}", adapter.name());
    }
    if failed > 0 {
        bail!("{failed} of {} services failed their probe", adapters.len());
    }
    Ok(())
}

async fn cmd_run(pipeline: Pipeline<ItemBackend>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        signal.cancel();
    });

    pipeline.run(shutdown).await?;
    Ok(())
}

pub mod factory;
pub mod http;
pub mod jackett;
pub mod orionoid;
pub mod plex;
pub mod real_debrid;
pub mod torrentio;

pub use factory::HttpAdapterFactory;
pub use jackett::JackettScraper;
pub use orionoid::OrionoidScraper;
pub use plex::PlexMediaServer;
pub use real_debrid::RealDebrid;
pub use torrentio::TorrentioScraper;

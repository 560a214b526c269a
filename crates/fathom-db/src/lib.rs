pub mod backend;
pub mod config;
pub mod database;
pub mod item_repository;

pub use backend::ItemBackend;
pub use config::DatabaseConfig;
pub use database::Database;
pub use item_repository::PgItemRepository;

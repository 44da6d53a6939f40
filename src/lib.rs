pub mod adapter;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod ids;
pub mod migrations;
pub mod models;
pub mod password;
pub mod probe;
pub mod schema;
pub mod snapshot;
pub mod stores;
pub mod template;
pub mod transfer;
pub mod validation;

pub use db::{Database, DatabaseConfig};
pub use error::{StoreError, StoreResult};
pub use snapshot::Snapshot;
pub use transfer::{export_database, import_snapshot, run_migrations, ImportMode};
pub use validation::{validate, validate_value, ValidationReport};

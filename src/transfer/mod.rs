//! Moving whole databases, or single companies, in and out as snapshots.

mod export;
mod import;
mod swap;

pub use export::{export_database, export_snapshot};
pub use import::{import_snapshot, run_migrations, ImportMode, ImportReport, MigrationRun};
pub use swap::{backup_path, temp_path};

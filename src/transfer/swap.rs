//! Full replacement of a SQLite database by swapping files.
//!
//! The new contents are built and validated in `<db>.tmp`. Only then is the
//! live file moved to `<db>.backup` and the temporary file renamed into its
//! place. Anything that fails before the first rename leaves the live file
//! alone.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::adapter::Conn;
use crate::db::{open_sqlite, Database};
use crate::error::{StoreError, StoreResult};
use crate::migrations::{LATEST_DATA_VERSION, LATEST_SCHEMA_VERSION};
use crate::schema;
use crate::snapshot::Snapshot;
use crate::stores::settings;
use crate::transfer::export::export_snapshot;
use crate::transfer::import::{insert_snapshot, ImportReport};
use crate::validation;

const SIDE_FILES: [&str; 2] = ["-wal", "-shm"];

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

pub fn temp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, ".backup")
}

/// The database file plus its journal side files.
fn artifacts(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    files.extend(SIDE_FILES.iter().map(|suffix| with_suffix(path, suffix)));
    files
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Deletes the temporary database and its side files when dropped.
struct TempDatabase {
    path: PathBuf,
}

impl TempDatabase {
    fn create(path: PathBuf) -> StoreResult<Self> {
        let guard = Self { path };
        // Leftovers from an earlier crash would otherwise be imported into.
        guard.remove()?;
        Ok(guard)
    }

    fn remove(&self) -> io::Result<()> {
        for file in artifacts(&self.path) {
            remove_if_present(&file)?;
        }
        Ok(())
    }
}

impl Drop for TempDatabase {
    fn drop(&mut self) {
        if let Err(err) = self.remove() {
            warn!(path = %self.path.display(), error = %err, "failed to remove temporary database");
        }
    }
}

/// Writes `snapshot` into a fresh database at `path`, then reads it back and
/// validates what was written.
fn build_temp_database(path: &Path, snapshot: &Snapshot) -> StoreResult<ImportReport> {
    let mut raw = open_sqlite(path)?;
    let mut conn = Conn::Sqlite(&mut raw);

    schema::initialize(&mut conn)?;
    let report = conn.transaction(|tx| {
        let report = insert_snapshot(tx, snapshot)?;
        settings::set_versions(tx, LATEST_DATA_VERSION, LATEST_SCHEMA_VERSION)?;
        Ok(report)
    })?;

    let written = export_snapshot(&mut conn, None)?;
    let check = validation::validate(&written);
    if !check.valid {
        return Err(StoreError::Validation(check));
    }
    conn.checkpoint()?;
    Ok(report)
}

fn rename_artifacts(from: &Path, to: &Path) -> io::Result<()> {
    for (source, target) in artifacts(from).into_iter().zip(artifacts(to)) {
        if source.exists() {
            fs::rename(&source, &target)?;
        }
    }
    Ok(())
}

/// Moves the live database aside and the temporary one into place. On a
/// failed second step the backup is moved back.
fn swap_files(live: &Path, temp: &Path) -> StoreResult<()> {
    let backup = backup_path(live);
    for file in artifacts(&backup) {
        remove_if_present(&file)?;
    }

    rename_artifacts(live, &backup)
        .map_err(|err| StoreError::Swap(format!("moving live database aside: {err}")))?;
    info!(backup = %backup.display(), "moved live database to backup");

    if let Err(err) = fs::rename(temp, live) {
        warn!(error = %err, "failed to move new database into place, restoring backup");
        if let Err(restore_err) = rename_artifacts(&backup, live) {
            error!(
                live = %live.display(),
                backup = %backup.display(),
                error = %restore_err,
                "failed to restore database backup; manual recovery required"
            );
            return Err(StoreError::Swap(format!(
                "installing new database failed ({err}) and restoring {} failed ({restore_err})",
                backup.display()
            )));
        }
        return Err(StoreError::Swap(format!("installing new database: {err}")));
    }

    for file in artifacts(&backup) {
        if let Err(err) = remove_if_present(&file) {
            warn!(path = %file.display(), error = %err, "failed to remove database backup");
        }
    }
    Ok(())
}

pub(super) async fn replace_sqlite(db: &Database, snapshot: Snapshot) -> StoreResult<ImportReport> {
    let live = db
        .sqlite_path()
        .map(Path::to_path_buf)
        .ok_or_else(|| StoreError::invariant("file swap requires a sqlite database"))?;
    let temp = TempDatabase::create(temp_path(&live))?;

    let temp_path = temp.path.clone();
    let report = tokio::task::spawn_blocking(move || build_temp_database(&temp_path, &snapshot))
        .await??;
    info!(
        companies = report.companies,
        users = report.users,
        documents = report.documents,
        "built replacement database"
    );

    db.checkpoint().await?;
    db.release().await?;

    let swap_live = live.clone();
    let swap_temp = temp.path.clone();
    let swapped = tokio::task::spawn_blocking(move || swap_files(&swap_live, &swap_temp)).await?;
    drop(temp);
    swapped?;

    db.reset_and_reopen().await?;
    info!(path = %live.display(), "swapped in replacement database");
    Ok(report)
}

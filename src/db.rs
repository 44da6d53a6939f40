use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::deserialize::QueryableByName;
use diesel::pg::{Pg, PgConnection};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::{Sqlite, SqliteConnection};
use diesel::Connection;
use tracing::{info, warn};

use crate::adapter::{Conn, Dialect, QueryOutput, SqlParam};
use crate::error::{StoreError, StoreResult};
use crate::schema;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

pub const DEFAULT_MAX_POOL_SIZE: u32 = 4;

pub fn init_pool_with_size(database_url: &str, max_size: u32) -> StoreResult<PgPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool_size = max_size.max(1);
    let pool = Pool::builder()
        .max_size(pool_size)
        .connection_timeout(Duration::from_secs(10))
        .build(manager)?;
    Ok(pool)
}

#[derive(Debug, Clone)]
pub enum DatabaseConfig {
    Postgres { url: String, max_pool_size: u32 },
    Sqlite { path: PathBuf, allowed_dirs: Vec<PathBuf> },
}

/// Cheaply cloneable handle over one of the two backends.
///
/// The SQLite side owns exactly one connection behind a mutex, so every call
/// is serialized. After [`Database::close`] the handle refuses work until
/// [`Database::reset_and_reopen`] is called.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Backend,
    schema_ready: AtomicBool,
    closed: AtomicBool,
}

enum Backend {
    Postgres(PgPool),
    Sqlite(SqliteHandle),
}

struct SqliteHandle {
    path: PathBuf,
    conn: Mutex<Option<SqliteConnection>>,
}

impl Database {
    pub fn open(config: &DatabaseConfig) -> StoreResult<Self> {
        match config {
            DatabaseConfig::Postgres { url, max_pool_size } => {
                Ok(Self::postgres(init_pool_with_size(url, *max_pool_size)?))
            }
            DatabaseConfig::Sqlite { path, allowed_dirs } => Self::sqlite(path, allowed_dirs),
        }
    }

    /// Opens the handle and makes sure the schema exists.
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let db = Self::open(config)?;
        db.ensure_schema().await?;
        Ok(db)
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self::from_backend(Backend::Postgres(pool))
    }

    pub fn sqlite(path: impl AsRef<Path>, allowed_dirs: &[PathBuf]) -> StoreResult<Self> {
        let path = validate_database_path(path.as_ref(), allowed_dirs)?;
        let conn = open_sqlite(&path)?;
        info!(path = %path.display(), "opened sqlite database");
        Ok(Self::from_backend(Backend::Sqlite(SqliteHandle {
            path,
            conn: Mutex::new(Some(conn)),
        })))
    }

    fn from_backend(backend: Backend) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                schema_ready: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn dialect(&self) -> Dialect {
        match &self.inner.backend {
            Backend::Postgres(_) => Dialect::Postgres,
            Backend::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub fn sqlite_path(&self) -> Option<&Path> {
        match &self.inner.backend {
            Backend::Postgres(_) => None,
            Backend::Sqlite(handle) => Some(&handle.path),
        }
    }

    /// Runs `f` on a blocking thread with a connection from the backend.
    pub async fn run<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Conn<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.with_conn(f)).await?
    }

    pub async fn transaction<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Conn<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(move |conn| conn.transaction(f)).await
    }

    pub async fn query<R>(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> StoreResult<QueryOutput<R>>
    where
        R: QueryableByName<Pg> + QueryableByName<Sqlite> + Send + 'static,
    {
        let sql = sql.into();
        self.run(move |conn| conn.query(&sql, &params)).await
    }

    pub async fn execute(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> StoreResult<usize> {
        let sql = sql.into();
        self.run(move |conn| conn.execute(&sql, &params)).await
    }

    pub async fn exec(&self, sql: impl Into<String>) -> StoreResult<()> {
        let sql = sql.into();
        self.run(move |conn| conn.exec(&sql)).await
    }

    /// Creates any missing tables, columns and version markers. Safe to run
    /// against an initialized database.
    pub async fn initialize_schema(&self) -> StoreResult<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner.schema_ready.store(false, Ordering::SeqCst);
            inner.with_conn(schema::initialize)?;
            inner.schema_ready.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await?
    }

    /// Like [`Database::initialize_schema`] but skips the work once it has
    /// succeeded for the current connection.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        if self.inner.schema_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.initialize_schema().await
    }

    pub async fn optimize(&self) -> StoreResult<()> {
        self.run(|conn| conn.optimize()).await
    }

    pub async fn checkpoint(&self) -> StoreResult<()> {
        self.run(|conn| conn.checkpoint()).await
    }

    pub async fn close(&self) -> StoreResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.release().await
    }

    /// Drops the cached SQLite connection without closing the handle; the
    /// next call opens the file again.
    pub(crate) async fn release(&self) -> StoreResult<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            if let Backend::Sqlite(handle) = &inner.backend {
                let mut guard = handle.conn.lock().unwrap_or_else(|err| err.into_inner());
                guard.take();
                inner.schema_ready.store(false, Ordering::SeqCst);
            }
        })
        .await?;
        Ok(())
    }

    /// Discards any cached connection and opens the database file again.
    /// Called after the file has been swapped underneath the handle.
    pub async fn reset_and_reopen(&self) -> StoreResult<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            inner.schema_ready.store(false, Ordering::SeqCst);
            if let Backend::Sqlite(handle) = &inner.backend {
                let mut guard = handle.conn.lock().unwrap_or_else(|err| err.into_inner());
                guard.take();
                *guard = Some(open_sqlite(&handle.path)?);
                info!(path = %handle.path.display(), "reopened sqlite database");
            }
            inner.closed.store(false, Ordering::SeqCst);
            Ok(())
        })
        .await??;
        self.ensure_schema().await
    }
}

impl Inner {
    fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Conn<'_>) -> StoreResult<T>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }

        match &self.backend {
            Backend::Postgres(pool) => {
                let mut pooled = pool.get()?;
                let conn: &mut PgConnection = &mut pooled;
                f(&mut Conn::Postgres(conn))
            }
            Backend::Sqlite(handle) => {
                let mut guard = handle.conn.lock().unwrap_or_else(|err| err.into_inner());
                if guard.is_none() {
                    *guard = Some(open_sqlite(&handle.path)?);
                    self.schema_ready.store(false, Ordering::SeqCst);
                }
                let conn = guard.as_mut().ok_or(StoreError::Closed)?;
                f(&mut Conn::Sqlite(conn))
            }
        }
    }
}

pub(crate) fn open_sqlite(path: &Path) -> StoreResult<SqliteConnection> {
    let url = path
        .to_str()
        .ok_or_else(|| StoreError::UnsafePath(format!("{} is not valid UTF-8", path.display())))?;
    let mut conn = SqliteConnection::establish(url)?;
    conn.batch_execute(
        "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; \
         PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}

/// Resolves `path` and checks that it lives inside one of `allowed_dirs`.
/// The file itself may not exist yet, but its parent directory must.
pub fn validate_database_path(path: &Path, allowed_dirs: &[PathBuf]) -> StoreResult<PathBuf> {
    if allowed_dirs.is_empty() {
        return Err(StoreError::UnsafePath(
            "no allowed data directories configured".to_string(),
        ));
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(StoreError::UnsafePath(format!(
            "{} contains a parent directory component",
            path.display()
        )));
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::UnsafePath(format!("{} has no file name", path.display())))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let parent = fs::canonicalize(parent)
        .map_err(|err| StoreError::UnsafePath(format!("{}: {err}", parent.display())))?;
    let mut resolved = parent.join(file_name);
    if resolved.exists() {
        resolved = fs::canonicalize(&resolved)?;
    }

    for dir in allowed_dirs {
        match fs::canonicalize(dir) {
            Ok(base) if resolved.starts_with(&base) => return Ok(resolved),
            Ok(_) => {}
            Err(err) => warn!(dir = %dir.display(), error = %err, "skipping unusable data directory"),
        }
    }

    Err(StoreError::UnsafePath(format!(
        "{} is outside the allowed data directories",
        resolved.display()
    )))
}

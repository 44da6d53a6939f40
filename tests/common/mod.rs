use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use docvault::adapter::Conn;
use docvault::db::{self, Database, DatabaseConfig};
use docvault::schema;
use docvault::snapshot::Snapshot;
use docvault::StoreResult;
use once_cell::sync::Lazy;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Mutex;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// A SQLite database in its own temporary directory.
pub struct TestDb {
    pub db: Database,
    pub path: PathBuf,
    dir: TempDir,
}

impl TestDb {
    pub async fn sqlite() -> Result<Self> {
        let dir = tempfile::tempdir().context("failed to create temp dir")?;
        let path = dir.path().join("docvault.db");
        let db = Database::connect(&DatabaseConfig::Sqlite {
            path: path.clone(),
            allowed_dirs: vec![dir.path().to_path_buf()],
        })
        .await
        .context("failed to open sqlite test database")?;
        let path = db.sqlite_path().map(Path::to_path_buf).unwrap_or(path);
        Ok(Self { db, path, dir })
    }

    #[allow(dead_code)]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Names of every file in the database directory, sorted.
    #[allow(dead_code)]
    pub fn files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.dir.path())? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    #[allow(dead_code)]
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Conn<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.db.run(f).await?)
    }
}

/// A PostgreSQL database from `TEST_DATABASE_URL`, emptied and rebuilt.
/// `None` when the variable is unset so the suite still runs without a
/// server; the skipped test is named on stderr.
#[allow(dead_code)]
pub async fn postgres(test_name: &str) -> Result<Option<Database>> {
    let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
        eprintln!("SKIPPED {test_name}: TEST_DATABASE_URL not set");
        return Ok(None);
    };
    let pool = db::init_pool_with_size(&database_url, 8)?;
    let database = Database::postgres(pool);
    database
        .run(|conn| {
            schema::drop_all(conn)?;
            schema::initialize(conn)
        })
        .await
        .context("failed to reset postgres test database")?;
    Ok(Some(database))
}

#[allow(dead_code)]
pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

/// One company with one admin and one connection.
#[allow(dead_code)]
pub fn acme_snapshot() -> Snapshot {
    serde_json::from_value(json!({
        "version": 6,
        "companies": [{
            "id": 1,
            "name": "Acme",
            "subdomain": "acme",
            "users": [{"id": 1, "role": "admin", "home_folder": ""}],
            "documents": [{"id": 1, "type": "connection", "path": "/org/connections/db1"}]
        }]
    }))
    .expect("acme snapshot")
}

/// Two fully specified companies, shaped exactly as an export returns them.
#[allow(dead_code)]
pub fn two_company_snapshot() -> Snapshot {
    let at = "2024-03-01T09:30:00";
    serde_json::from_value(json!({
        "version": 6,
        "companies": [
            {
                "id": 1,
                "name": "Acme",
                "display_name": "Acme Inc.",
                "subdomain": "acme",
                "created_at": at,
                "updated_at": at,
                "users": [
                    {
                        "id": 1, "company_id": 1, "email": "ada@acme.test", "name": "Ada",
                        "password_hash": null, "phone": null, "state": null,
                        "home_folder": "", "role": "admin",
                        "created_at": at, "updated_at": at
                    },
                    {
                        "id": 2, "company_id": 1, "email": "vic@acme.test", "name": "Vic",
                        "password_hash": null, "phone": "+100", "state": null,
                        "home_folder": "sales", "role": "viewer",
                        "created_at": at, "updated_at": at
                    }
                ],
                "documents": [
                    {
                        "id": 1, "company_id": 1, "name": "db1", "path": "/org/connections/db1",
                        "type": "connection", "content": {"dialect": "duckdb"}, "references": [],
                        "created_at": at, "updated_at": at
                    },
                    {
                        "id": 2, "company_id": 1, "name": "revenue", "path": "/org/sales/revenue",
                        "type": "question", "content": {"query": "select 1"}, "references": [],
                        "created_at": at, "updated_at": at
                    },
                    {
                        "id": 3, "company_id": 1, "name": "overview", "path": "/org/sales/overview",
                        "type": "dashboard",
                        "content": {"assets": [{"type": "question", "id": 2}, {"type": "text", "content": "hi"}]},
                        "references": [2],
                        "created_at": at, "updated_at": at
                    }
                ],
                "access_tokens": [
                    {
                        "token": "shared-overview-token", "company_id": 1, "file_id": 3,
                        "view_as_user_id": 2, "created_by_user_id": 1,
                        "created_at": at, "expires_at": "2099-01-01T00:00:00", "is_active": true
                    }
                ]
            },
            {
                "id": 2,
                "name": "Globex",
                "display_name": "Globex",
                "subdomain": "globex",
                "created_at": at,
                "updated_at": at,
                "users": [
                    {
                        "id": 1, "company_id": 2, "email": "hank@globex.test", "name": "Hank",
                        "password_hash": null, "phone": null, "state": null,
                        "home_folder": "", "role": "admin",
                        "created_at": at, "updated_at": at
                    }
                ],
                "documents": [
                    {
                        "id": 1, "company_id": 2, "name": "warehouse", "path": "/org/connections/warehouse",
                        "type": "connection", "content": {}, "references": [],
                        "created_at": at, "updated_at": at
                    },
                    {
                        "id": 2, "company_id": 2, "name": "notes", "path": "/org/notes",
                        "type": "notebook", "content": {"assets": []}, "references": [],
                        "created_at": at, "updated_at": at
                    }
                ]
            }
        ]
    }))
    .expect("two company snapshot")
}

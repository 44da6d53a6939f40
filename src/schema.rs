//! Canonical DDL for both dialects.
//!
//! The two definitions differ textually (serial keys, boolean and timestamp
//! storage) but describe the same tables. Tables are only ever created here;
//! a schema change that cannot be expressed as an added nullable column is
//! handled by recreating the database through a full export and import.

use chrono::Utc;
use tracing::info;

use crate::adapter::{Conn, Dialect};
use crate::error::StoreResult;
use crate::migrations::{LATEST_DATA_VERSION, LATEST_SCHEMA_VERSION};
use crate::stores::settings::{self, DATA_VERSION_KEY, SCHEMA_VERSION_KEY};

/// Version assumed for databases created before versions were recorded.
pub const INITIAL_VERSION: i64 = 1;

pub const TABLES: &[&str] = &["access_tokens", "files", "users", "companies", "config"];

const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL DEFAULT '',
    subdomain TEXT NOT NULL UNIQUE,
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    company_id BIGINT NOT NULL REFERENCES companies (id) ON DELETE CASCADE,
    id BIGINT NOT NULL,
    email TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    password_hash TEXT,
    phone TEXT,
    state TEXT,
    home_folder TEXT NOT NULL DEFAULT '',
    role TEXT NOT NULL CHECK (role IN ('admin', 'editor', 'viewer')),
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL,
    PRIMARY KEY (company_id, id),
    UNIQUE (company_id, email)
);

CREATE TABLE IF NOT EXISTS files (
    company_id BIGINT NOT NULL REFERENCES companies (id) ON DELETE CASCADE,
    id BIGINT NOT NULL,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    type TEXT NOT NULL,
    content TEXT NOT NULL,
    file_references TEXT NOT NULL DEFAULT '[]',
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL,
    PRIMARY KEY (company_id, id),
    UNIQUE (company_id, path)
);

CREATE INDEX IF NOT EXISTS idx_files_company_type ON files (company_id, type);

CREATE TABLE IF NOT EXISTS access_tokens (
    token TEXT PRIMARY KEY,
    company_id BIGINT NOT NULL REFERENCES companies (id) ON DELETE CASCADE,
    file_id BIGINT NOT NULL,
    view_as_user_id BIGINT NOT NULL,
    created_by_user_id BIGINT NOT NULL,
    created_at TIMESTAMP NOT NULL,
    expires_at TIMESTAMP NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE INDEX IF NOT EXISTS idx_access_tokens_file ON access_tokens (company_id, file_id);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
"#;

const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL DEFAULT '',
    subdomain TEXT NOT NULL UNIQUE,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    company_id INTEGER NOT NULL REFERENCES companies (id) ON DELETE CASCADE,
    id INTEGER NOT NULL,
    email TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    password_hash TEXT,
    phone TEXT,
    state TEXT,
    home_folder TEXT NOT NULL DEFAULT '',
    role TEXT NOT NULL CHECK (role IN ('admin', 'editor', 'viewer')),
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    PRIMARY KEY (company_id, id),
    UNIQUE (company_id, email)
);

CREATE TABLE IF NOT EXISTS files (
    company_id INTEGER NOT NULL REFERENCES companies (id) ON DELETE CASCADE,
    id INTEGER NOT NULL,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    type TEXT NOT NULL,
    content TEXT NOT NULL,
    file_references TEXT NOT NULL DEFAULT '[]',
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    PRIMARY KEY (company_id, id),
    UNIQUE (company_id, path)
);

CREATE INDEX IF NOT EXISTS idx_files_company_type ON files (company_id, type);

CREATE TABLE IF NOT EXISTS access_tokens (
    token TEXT PRIMARY KEY,
    company_id INTEGER NOT NULL REFERENCES companies (id) ON DELETE CASCADE,
    file_id INTEGER NOT NULL,
    view_as_user_id INTEGER NOT NULL,
    created_by_user_id INTEGER NOT NULL,
    created_at DATETIME NOT NULL,
    expires_at DATETIME NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_access_tokens_file ON access_tokens (company_id, file_id);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at DATETIME NOT NULL
);
"#;

/// Columns added after the first release. Databases created before a column
/// existed get it added (nullable) on initialization.
const LATE_COLUMNS: &[(&str, &str, &str)] = &[
    ("companies", "display_name", "TEXT NOT NULL DEFAULT ''"),
    ("companies", "subdomain", "TEXT"),
    ("users", "phone", "TEXT"),
    ("users", "state", "TEXT"),
    ("users", "home_folder", "TEXT NOT NULL DEFAULT ''"),
];

pub fn ddl(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => POSTGRES_SCHEMA,
        Dialect::Sqlite => SQLITE_SCHEMA,
    }
}

/// Idempotently brings the physical schema to the current table layout and
/// seeds the version markers of a fresh database.
pub fn initialize(conn: &mut Conn<'_>) -> StoreResult<()> {
    let dialect = conn.dialect();
    conn.transaction(|tx| {
        // Tables that predate the version markers hold data of unknown
        // vintage; start them at the first version so every migration runs.
        let fresh = !tx.table_exists("companies")?;
        tx.exec(ddl(dialect))?;

        for (table, column, definition) in LATE_COLUMNS {
            if !tx.column_exists(table, column)? {
                info!(table, column, "adding missing column");
                tx.exec(&format!(
                    "ALTER TABLE {table} ADD COLUMN {column} {definition};"
                ))?;
            }
        }

        let (data_version, schema_version) = if fresh {
            (LATEST_DATA_VERSION, LATEST_SCHEMA_VERSION)
        } else {
            (INITIAL_VERSION, INITIAL_VERSION)
        };
        let now = Utc::now().naive_utc();
        settings::insert_if_absent(tx, DATA_VERSION_KEY, &data_version.to_string(), now)?;
        settings::insert_if_absent(tx, SCHEMA_VERSION_KEY, &schema_version.to_string(), now)?;
        Ok(())
    })?;

    info!(dialect = dialect.as_str(), "schema initialized");
    Ok(())
}

/// Drops every table so the schema can be rebuilt from [`ddl`].
pub fn drop_all(conn: &mut Conn<'_>) -> StoreResult<()> {
    for table in TABLES {
        conn.exec(&format!("DROP TABLE IF EXISTS {table};"))?;
    }
    Ok(())
}

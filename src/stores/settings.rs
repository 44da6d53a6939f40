//! Global key/value settings, including the data and schema version markers.

use chrono::{NaiveDateTime, Utc};

use crate::adapter::Conn;
use crate::error::{StoreError, StoreResult};
use crate::models::Setting;

pub const DATA_VERSION_KEY: &str = "data_version";
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

pub fn get(conn: &mut Conn<'_>, key: &str) -> StoreResult<Option<String>> {
    let row: Option<Setting> =
        conn.query_opt("SELECT key, value FROM config WHERE key = $1", &[key.into()])?;
    Ok(row.map(|setting| setting.value))
}

pub fn get_i64(conn: &mut Conn<'_>, key: &str) -> StoreResult<Option<i64>> {
    get(conn, key)?
        .map(|value| {
            value
                .trim()
                .parse::<i64>()
                .map_err(|_| StoreError::invalid(format!("config {key} is not an integer: {value:?}")))
        })
        .transpose()
}

pub fn set(conn: &mut Conn<'_>, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO config (key, value, updated_at) VALUES ($1, $2, $3) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        &[key.into(), value.into(), Utc::now().naive_utc().into()],
    )?;
    Ok(())
}

pub(crate) fn insert_if_absent(
    conn: &mut Conn<'_>,
    key: &str,
    value: &str,
    now: NaiveDateTime,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO config (key, value, updated_at) VALUES ($1, $2, $3) \
         ON CONFLICT (key) DO NOTHING",
        &[key.into(), value.into(), now.into()],
    )?;
    Ok(())
}

pub fn delete(conn: &mut Conn<'_>, key: &str) -> StoreResult<bool> {
    let affected = conn.execute("DELETE FROM config WHERE key = $1", &[key.into()])?;
    Ok(affected > 0)
}

pub fn list(conn: &mut Conn<'_>) -> StoreResult<Vec<Setting>> {
    Ok(conn
        .query("SELECT key, value FROM config ORDER BY key", &[])?
        .rows)
}

pub fn data_version(conn: &mut Conn<'_>) -> StoreResult<Option<i64>> {
    get_i64(conn, DATA_VERSION_KEY)
}

pub fn schema_version(conn: &mut Conn<'_>) -> StoreResult<Option<i64>> {
    get_i64(conn, SCHEMA_VERSION_KEY)
}

pub fn set_versions(conn: &mut Conn<'_>, data_version: i64, schema_version: i64) -> StoreResult<()> {
    set(conn, DATA_VERSION_KEY, &data_version.to_string())?;
    set(conn, SCHEMA_VERSION_KEY, &schema_version.to_string())
}

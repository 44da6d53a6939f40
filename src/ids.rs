//! Per-company identifier allocation.
//!
//! Users and files are numbered per company (`max(id) + 1`). The computation
//! and the insert that consumes it run as one statement. On Postgres that
//! statement is additionally serialized per (company, table) with a
//! transaction-scoped advisory lock, so concurrent writers never observe the
//! same maximum.

use diesel::sql_types::{BigInt, Nullable};
use diesel::QueryableByName;

use crate::adapter::{Conn, SqlParam};
use crate::error::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdTable {
    Users,
    Files,
}

impl IdTable {
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Files => "files",
        }
    }

    fn discriminator(self) -> i64 {
        match self {
            Self::Users => 1,
            Self::Files => 2,
        }
    }
}

#[derive(Debug, QueryableByName)]
struct IdRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

#[derive(Debug, QueryableByName)]
struct MaxIdRow {
    #[diesel(sql_type = Nullable<BigInt>)]
    max_id: Option<i64>,
}

/// Lock key for a (company, table) pair. The low byte carries the table so
/// locks for users and files of one company never contend.
pub fn advisory_lock_key(table: IdTable, company_id: i64) -> i64 {
    (company_id << 8) | table.discriminator()
}

/// The id the next insert for `company_id` would receive.
pub fn next_id(conn: &mut Conn<'_>, table: IdTable, company_id: i64) -> StoreResult<i64> {
    let sql = format!(
        "SELECT MAX(id) AS max_id FROM {} WHERE company_id = $1",
        table.table_name()
    );
    let row: MaxIdRow = conn.query_one(&sql, &[company_id.into()])?;
    Ok(row.max_id.unwrap_or(0) + 1)
}

/// Inserts one row into `table` for `company_id`, allocating its id in the
/// same statement, and returns the id.
///
/// `values` bind to `columns` in order; `company_id` and `id` are filled in.
pub fn insert_with_next_id(
    conn: &mut Conn<'_>,
    table: IdTable,
    company_id: i64,
    columns: &[&str],
    values: Vec<SqlParam>,
) -> StoreResult<i64> {
    debug_assert_eq!(columns.len(), values.len());
    let table_name = table.table_name();
    let placeholders = (0..values.len())
        .map(|index| format!("${}", index + 2))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {table_name} (company_id, id, {columns}) \
         SELECT $1, COALESCE(MAX(id), 0) + 1, {placeholders} \
         FROM {table_name} WHERE company_id = $1 RETURNING id",
        columns = columns.join(", "),
    );

    let mut params = Vec::with_capacity(values.len() + 1);
    params.push(SqlParam::Int(company_id));
    params.extend(values);

    conn.transaction(|tx| {
        tx.advisory_xact_lock(advisory_lock_key(table, company_id))?;
        let row: IdRow = tx.query_one(&sql, &params)?;
        Ok(row.id)
    })
}

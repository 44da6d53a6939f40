use std::borrow::Cow;

use chrono::NaiveDateTime;
use diesel::connection::SimpleConnection;
use diesel::deserialize::QueryableByName;
use diesel::pg::{Pg, PgConnection};
use diesel::sql_types::{BigInt, Bool, Integer, Nullable, Text, Timestamp};
use diesel::sqlite::{Sqlite, SqliteConnection};
use diesel::{Connection, RunQueryDsl};
use tracing::warn;

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }
}

/// A positional bind value for `$n` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Int(i64),
    NullableInt(Option<i64>),
    Text(String),
    NullableText(Option<String>),
    Bool(bool),
    Timestamp(NaiveDateTime),
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Option<i64>> for SqlParam {
    fn from(value: Option<i64>) -> Self {
        Self::NullableInt(value)
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Option<String>> for SqlParam {
    fn from(value: Option<String>) -> Self {
        Self::NullableText(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<NaiveDateTime> for SqlParam {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

#[derive(Debug, Clone)]
pub struct QueryOutput<R> {
    pub rows: Vec<R>,
    pub row_count: usize,
}

#[derive(Debug, QueryableByName)]
pub struct CountRow {
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

#[derive(Debug, QueryableByName)]
struct CheckpointRow {
    #[diesel(sql_type = Integer)]
    busy: i32,
    #[diesel(sql_type = Integer)]
    log: i32,
    #[diesel(sql_type = Integer)]
    checkpointed: i32,
}

macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param.clone() {
                SqlParam::Int(value) => query.bind::<BigInt, _>(value),
                SqlParam::NullableInt(value) => query.bind::<Nullable<BigInt>, _>(value),
                SqlParam::Text(value) => query.bind::<Text, _>(value),
                SqlParam::NullableText(value) => query.bind::<Nullable<Text>, _>(value),
                SqlParam::Bool(value) => query.bind::<Bool, _>(value),
                SqlParam::Timestamp(value) => query.bind::<Timestamp, _>(value),
            };
        }
        query
    }};
}

/// A live connection to either backend. Transactions hand the callback a
/// `Conn` over the same physical connection, never the native handle.
pub enum Conn<'a> {
    Postgres(&'a mut PgConnection),
    Sqlite(&'a mut SqliteConnection),
}

impl Conn<'_> {
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Postgres(_) => Dialect::Postgres,
            Self::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub fn query<R>(&mut self, sql: &str, params: &[SqlParam]) -> StoreResult<QueryOutput<R>>
    where
        R: QueryableByName<Pg> + QueryableByName<Sqlite> + 'static,
    {
        let rows: Vec<R> = match self {
            Self::Postgres(conn) => {
                let query = bind_params!(diesel::sql_query(sql).into_boxed::<Pg>(), params);
                query.load(&mut **conn)?
            }
            Self::Sqlite(conn) => {
                let sql = translate_placeholders(sql, Dialect::Sqlite);
                let query = bind_params!(
                    diesel::sql_query(sql.into_owned()).into_boxed::<Sqlite>(),
                    params
                );
                query.load(&mut **conn)?
            }
        };
        let row_count = rows.len();
        Ok(QueryOutput { rows, row_count })
    }

    pub fn query_opt<R>(&mut self, sql: &str, params: &[SqlParam]) -> StoreResult<Option<R>>
    where
        R: QueryableByName<Pg> + QueryableByName<Sqlite> + 'static,
    {
        Ok(self.query(sql, params)?.rows.into_iter().next())
    }

    pub fn query_one<R>(&mut self, sql: &str, params: &[SqlParam]) -> StoreResult<R>
    where
        R: QueryableByName<Pg> + QueryableByName<Sqlite> + 'static,
    {
        self.query_opt(sql, params)?
            .ok_or(StoreError::Database(diesel::result::Error::NotFound))
    }

    /// Runs a single statement and returns the number of affected rows.
    pub fn execute(&mut self, sql: &str, params: &[SqlParam]) -> StoreResult<usize> {
        let affected = match self {
            Self::Postgres(conn) => {
                let query = bind_params!(diesel::sql_query(sql).into_boxed::<Pg>(), params);
                query.execute(&mut **conn)?
            }
            Self::Sqlite(conn) => {
                let sql = translate_placeholders(sql, Dialect::Sqlite);
                let query = bind_params!(
                    diesel::sql_query(sql.into_owned()).into_boxed::<Sqlite>(),
                    params
                );
                query.execute(&mut **conn)?
            }
        };
        Ok(affected)
    }

    /// Runs a parameterless batch of statements separated by `;`.
    pub fn exec(&mut self, sql: &str) -> StoreResult<()> {
        match self {
            Self::Postgres(conn) => conn.batch_execute(sql)?,
            Self::Sqlite(conn) => conn.batch_execute(sql)?,
        }
        Ok(())
    }

    /// Runs `f` inside a transaction. Any error returned by `f` rolls the
    /// whole unit back; nested calls become savepoints.
    pub fn transaction<T, F>(&mut self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Conn<'_>) -> StoreResult<T>,
    {
        match self {
            Self::Postgres(conn) => conn.transaction(|tx| f(&mut Conn::Postgres(tx))),
            Self::Sqlite(conn) => conn.transaction(|tx| f(&mut Conn::Sqlite(tx))),
        }
    }

    pub fn count(&mut self, sql: &str, params: &[SqlParam]) -> StoreResult<i64> {
        let row: CountRow = self.query_one(sql, params)?;
        Ok(row.count)
    }

    pub fn column_exists(&mut self, table: &str, column: &str) -> StoreResult<bool> {
        let sql = match self.dialect() {
            Dialect::Postgres => {
                "SELECT COUNT(*) AS count FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2"
            }
            Dialect::Sqlite => "SELECT COUNT(*) AS count FROM pragma_table_info($1) WHERE name = $2",
        };
        let count = self.count(sql, &[table.into(), column.into()])?;
        Ok(count > 0)
    }

    pub fn table_exists(&mut self, table: &str) -> StoreResult<bool> {
        let sql = match self.dialect() {
            Dialect::Postgres => {
                "SELECT COUNT(*) AS count FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
            Dialect::Sqlite => {
                "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = $1"
            }
        };
        let count = self.count(sql, &[table.into()])?;
        Ok(count > 0)
    }

    /// Takes a transaction-scoped advisory lock. Released by the server at
    /// commit or rollback. No-op on SQLite, which has a single writer.
    pub fn advisory_xact_lock(&mut self, key: i64) -> StoreResult<()> {
        if let Self::Postgres(conn) = self {
            diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
                .bind::<BigInt, _>(key)
                .execute(&mut **conn)?;
        }
        Ok(())
    }

    /// Flushes the write-ahead log into the main database file and truncates
    /// it. No-op on Postgres.
    pub fn checkpoint(&mut self) -> StoreResult<()> {
        if let Self::Sqlite(conn) = self {
            let rows: Vec<CheckpointRow> =
                diesel::sql_query("PRAGMA wal_checkpoint(TRUNCATE)").load(&mut **conn)?;
            if let Some(row) = rows.first() {
                if row.busy != 0 {
                    warn!(
                        log_frames = row.log,
                        checkpointed = row.checkpointed,
                        "wal checkpoint could not complete"
                    );
                    return Err(StoreError::invariant(
                        "wal checkpoint blocked by another connection",
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn optimize(&mut self) -> StoreResult<()> {
        if let Self::Sqlite(_) = self {
            self.checkpoint()?;
            self.exec("PRAGMA optimize;")?;
        }
        Ok(())
    }
}

/// Rewrites `$n` placeholders into the dialect's native syntax. Quoted
/// literals and identifiers pass through untouched.
pub fn translate_placeholders(sql: &str, dialect: Dialect) -> Cow<'_, str> {
    if dialect == Dialect::Postgres || !sql.contains('$') {
        return Cow::Borrowed(sql);
    }

    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(ch) = chars.next() {
        match quote {
            Some(open) => {
                if ch == open {
                    quote = None;
                }
                out.push(ch);
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    out.push(ch);
                }
                '$' if chars.peek().is_some_and(|next| next.is_ascii_digit()) => {
                    out.push('?');
                    while let Some(digit) = chars.peek().copied().filter(char::is_ascii_digit) {
                        out.push(digit);
                        chars.next();
                    }
                }
                _ => out.push(ch),
            },
        }
    }

    Cow::Owned(out)
}

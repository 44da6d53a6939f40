use chrono::Utc;
use tracing::info;

use crate::adapter::{Conn, Dialect, SqlParam};
use crate::error::{StoreError, StoreResult};
use crate::models::{Company, CompanyUpdate, NewCompany};
use crate::snapshot::CompanyBundle;

// Databases that predate the subdomain column may still hold NULLs there.
const COMPANY_COLUMNS: &str =
    "id, name, display_name, COALESCE(subdomain, '') AS subdomain, created_at, updated_at";

pub fn create(conn: &mut Conn<'_>, new_company: &NewCompany) -> StoreResult<Company> {
    let name = new_company.name.trim();
    if name.is_empty() {
        return Err(StoreError::invalid("company name must not be empty"));
    }
    let subdomain = normalize_subdomain(&new_company.subdomain)?;
    let display_name = if new_company.display_name.trim().is_empty() {
        name.to_string()
    } else {
        new_company.display_name.trim().to_string()
    };
    let now = Utc::now().naive_utc();

    let company = conn.query_one(
        &format!(
            "INSERT INTO companies (name, display_name, subdomain, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $4) RETURNING {COMPANY_COLUMNS}"
        ),
        &[name.into(), display_name.into(), subdomain.into(), now.into()],
    )?;
    Ok(company)
}

pub fn get_by_id(conn: &mut Conn<'_>, id: i64) -> StoreResult<Option<Company>> {
    conn.query_opt(
        &format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE id = $1"),
        &[id.into()],
    )
}

pub fn get_by_name(conn: &mut Conn<'_>, name: &str) -> StoreResult<Option<Company>> {
    conn.query_opt(
        &format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE name = $1"),
        &[name.into()],
    )
}

pub fn get_by_subdomain(conn: &mut Conn<'_>, subdomain: &str) -> StoreResult<Option<Company>> {
    conn.query_opt(
        &format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE subdomain = $1"),
        &[subdomain.to_ascii_lowercase().into()],
    )
}

pub fn list(conn: &mut Conn<'_>) -> StoreResult<Vec<Company>> {
    Ok(conn
        .query(
            &format!("SELECT {COMPANY_COLUMNS} FROM companies ORDER BY id"),
            &[],
        )?
        .rows)
}

pub fn update(conn: &mut Conn<'_>, id: i64, changes: &CompanyUpdate) -> StoreResult<Company> {
    let mut assignments = Vec::new();
    let mut params: Vec<SqlParam> = Vec::new();

    if let Some(name) = &changes.name {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::invalid("company name must not be empty"));
        }
        params.push(name.into());
        assignments.push(format!("name = ${}", params.len()));
    }
    if let Some(display_name) = &changes.display_name {
        params.push(display_name.trim().into());
        assignments.push(format!("display_name = ${}", params.len()));
    }
    if let Some(subdomain) = &changes.subdomain {
        params.push(normalize_subdomain(subdomain)?.into());
        assignments.push(format!("subdomain = ${}", params.len()));
    }

    params.push(Utc::now().naive_utc().into());
    assignments.push(format!("updated_at = ${}", params.len()));
    params.push(id.into());

    let sql = format!(
        "UPDATE companies SET {} WHERE id = ${} RETURNING {COMPANY_COLUMNS}",
        assignments.join(", "),
        params.len()
    );
    conn.query_opt(&sql, &params)?
        .ok_or_else(|| StoreError::not_found(format!("company {id}")))
}

/// Deletes a company with everything it owns, children first.
pub fn delete(conn: &mut Conn<'_>, id: i64) -> StoreResult<bool> {
    conn.transaction(|tx| {
        tx.execute("DELETE FROM access_tokens WHERE company_id = $1", &[id.into()])?;
        tx.execute("DELETE FROM files WHERE company_id = $1", &[id.into()])?;
        tx.execute("DELETE FROM users WHERE company_id = $1", &[id.into()])?;
        let affected = tx.execute("DELETE FROM companies WHERE id = $1", &[id.into()])?;
        if affected > 0 {
            info!(company_id = id, "deleted company");
        }
        Ok(affected > 0)
    })
}

pub fn count(conn: &mut Conn<'_>) -> StoreResult<i64> {
    conn.count("SELECT COUNT(*) AS count FROM companies", &[])
}

/// Inserts a company row keeping the id from the snapshot.
pub fn insert_with_id(conn: &mut Conn<'_>, bundle: &CompanyBundle) -> StoreResult<()> {
    let subdomain = match bundle.subdomain.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => normalize_subdomain(raw)?,
        _ => String::new(),
    };
    let now = Utc::now().naive_utc();
    conn.execute(
        "INSERT INTO companies (id, name, display_name, subdomain, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
        &[
            bundle.id.into(),
            bundle.name.clone().into(),
            bundle.display_name.clone().into(),
            subdomain.into(),
            bundle.created_at.unwrap_or(now).into(),
            bundle.updated_at.unwrap_or(now).into(),
        ],
    )?;
    Ok(())
}

/// Moves the Postgres id sequence past ids inserted explicitly. SQLite's
/// AUTOINCREMENT tracks explicit ids on its own.
pub fn reset_sequence(conn: &mut Conn<'_>) -> StoreResult<()> {
    if conn.dialect() == Dialect::Postgres {
        conn.exec(
            "SELECT setval(pg_get_serial_sequence('companies', 'id'), \
             COALESCE((SELECT MAX(id) FROM companies), 0) + 1, false);",
        )?;
    }
    Ok(())
}

pub fn normalize_subdomain(raw: &str) -> StoreResult<String> {
    let subdomain = raw.trim().to_ascii_lowercase();
    let valid = !subdomain.is_empty()
        && subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
    if !valid {
        return Err(StoreError::invalid(format!("invalid subdomain {raw:?}")));
    }
    Ok(subdomain)
}

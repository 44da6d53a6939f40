//! Share tokens granting read access to one document as a chosen user.
//!
//! A token is checked against the clock each time it is read. Callers that
//! resolve a token get the same `None` for unknown, revoked and expired
//! tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, NaiveDateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, info};

use crate::adapter::Conn;
use crate::error::{StoreError, StoreResult};
use crate::models::{AccessToken, NewAccessToken, User};
use crate::stores::{documents, users};

pub const DEFAULT_TTL_DAYS: i64 = 30;

const TOKEN_COLUMNS: &str = "token, company_id, file_id, view_as_user_id, created_by_user_id, \
                             created_at, expires_at, is_active";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValidity {
    Valid,
    Revoked,
    Expired,
}

impl TokenValidity {
    pub fn is_valid(self) -> bool {
        self == Self::Valid
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn create(conn: &mut Conn<'_>, new_token: &NewAccessToken) -> StoreResult<AccessToken> {
    let company_id = new_token.company_id;
    if documents::get_by_id(conn, company_id, new_token.file_id)?.is_none() {
        return Err(StoreError::not_found(format!("document {}", new_token.file_id)));
    }
    for user_id in [new_token.view_as_user_id, new_token.created_by_user_id] {
        if users::get_by_id(conn, company_id, user_id)?.is_none() {
            return Err(StoreError::not_found(format!("user {user_id}")));
        }
    }

    let ttl = new_token.ttl.unwrap_or_else(|| Duration::days(DEFAULT_TTL_DAYS));
    if ttl <= Duration::zero() {
        return Err(StoreError::invalid("token lifetime must be positive"));
    }
    let now = Utc::now().naive_utc();
    let token = conn.query_one(
        &format!(
            "INSERT INTO access_tokens ({TOKEN_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {TOKEN_COLUMNS}"
        ),
        &[
            generate_token().into(),
            company_id.into(),
            new_token.file_id.into(),
            new_token.view_as_user_id.into(),
            new_token.created_by_user_id.into(),
            now.into(),
            (now + ttl).into(),
            true.into(),
        ],
    )?;
    info!(company_id, file_id = new_token.file_id, "created access token");
    Ok(token)
}

pub fn get(conn: &mut Conn<'_>, token: &str) -> StoreResult<Option<AccessToken>> {
    conn.query_opt(
        &format!("SELECT {TOKEN_COLUMNS} FROM access_tokens WHERE token = $1"),
        &[token.into()],
    )
}

pub fn list_for_file(conn: &mut Conn<'_>, company_id: i64, file_id: i64) -> StoreResult<Vec<AccessToken>> {
    Ok(conn
        .query(
            &format!(
                "SELECT {TOKEN_COLUMNS} FROM access_tokens \
                 WHERE company_id = $1 AND file_id = $2 ORDER BY created_at, token"
            ),
            &[company_id.into(), file_id.into()],
        )?
        .rows)
}

pub fn list_all(conn: &mut Conn<'_>, company_id: Option<i64>) -> StoreResult<Vec<AccessToken>> {
    let output = match company_id {
        Some(company_id) => conn.query(
            &format!(
                "SELECT {TOKEN_COLUMNS} FROM access_tokens WHERE company_id = $1 \
                 ORDER BY company_id, created_at, token"
            ),
            &[company_id.into()],
        )?,
        None => conn.query(
            &format!(
                "SELECT {TOKEN_COLUMNS} FROM access_tokens ORDER BY company_id, created_at, token"
            ),
            &[],
        )?,
    };
    Ok(output.rows)
}

pub fn revoke(conn: &mut Conn<'_>, token: &str) -> StoreResult<bool> {
    let affected = conn.execute(
        "UPDATE access_tokens SET is_active = $1 WHERE token = $2",
        &[false.into(), token.into()],
    )?;
    Ok(affected > 0)
}

pub fn delete(conn: &mut Conn<'_>, token: &str) -> StoreResult<bool> {
    let affected = conn.execute("DELETE FROM access_tokens WHERE token = $1", &[token.into()])?;
    Ok(affected > 0)
}

/// Validity of an already loaded token at `now`.
pub fn validate(token: &AccessToken, now: NaiveDateTime) -> TokenValidity {
    if !token.is_active {
        TokenValidity::Revoked
    } else if now > token.expires_at {
        TokenValidity::Expired
    } else {
        TokenValidity::Valid
    }
}

/// Looks up the user a token lets its bearer act as. Every failure mode
/// yields `None` so callers cannot tell them apart.
pub fn resolve(
    conn: &mut Conn<'_>,
    token: &str,
    now: NaiveDateTime,
) -> StoreResult<Option<(AccessToken, User)>> {
    let Some(access) = get(conn, token)? else {
        return Ok(None);
    };
    let validity = validate(&access, now);
    if !validity.is_valid() {
        debug!(company_id = access.company_id, ?validity, "rejected access token");
        return Ok(None);
    }
    let user = users::get_by_id(conn, access.company_id, access.view_as_user_id)?;
    Ok(user.map(|user| (access, user)))
}

/// Inserts a token row as exported.
pub fn insert(conn: &mut Conn<'_>, token: &AccessToken) -> StoreResult<()> {
    conn.execute(
        &format!("INSERT INTO access_tokens ({TOKEN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"),
        &[
            token.token.clone().into(),
            token.company_id.into(),
            token.file_id.into(),
            token.view_as_user_id.into(),
            token.created_by_user_id.into(),
            token.created_at.into(),
            token.expires_at.into(),
            token.is_active.into(),
        ],
    )?;
    Ok(())
}

use chrono::Utc;
use tracing::info;

use crate::adapter::{Conn, SqlParam};
use crate::error::{StoreError, StoreResult};
use crate::ids::{self, IdTable};
use crate::models::{NewUser, User, UserRole, UserRow, UserUpdate};
use crate::snapshot::SnapshotUser;

const USER_COLUMNS: &str = "company_id, id, email, name, password_hash, phone, state, \
                            home_folder, role, created_at, updated_at";

/// Admins always see the whole company tree. Everyone else gets a path
/// relative to the company root with surrounding slashes removed.
pub fn normalize_home_folder(role: UserRole, home_folder: &str) -> StoreResult<String> {
    if role == UserRole::Admin {
        return Ok(String::new());
    }
    let trimmed = home_folder.trim();
    if trimmed.starts_with('/') {
        return Err(StoreError::invalid(format!(
            "home folder must be a relative path, got {trimmed:?}"
        )));
    }
    let relative = trimmed.trim_matches('/');
    if relative.split('/').any(|segment| segment == "..") {
        return Err(StoreError::invalid(format!(
            "home folder must not leave the company root, got {trimmed:?}"
        )));
    }
    Ok(relative.to_string())
}

fn normalize_email(email: &str) -> StoreResult<String> {
    let email = email.trim().to_ascii_lowercase();
    if email.is_empty() {
        return Err(StoreError::invalid("email must not be empty"));
    }
    Ok(email)
}

pub fn create(conn: &mut Conn<'_>, company_id: i64, new_user: &NewUser) -> StoreResult<User> {
    let email = normalize_email(&new_user.email)?;
    let home_folder = normalize_home_folder(new_user.role, &new_user.home_folder)?;
    let now = Utc::now().naive_utc();

    let id = ids::insert_with_next_id(
        conn,
        IdTable::Users,
        company_id,
        &[
            "email",
            "name",
            "password_hash",
            "phone",
            "state",
            "home_folder",
            "role",
            "created_at",
            "updated_at",
        ],
        vec![
            email.into(),
            new_user.name.trim().into(),
            new_user.password_hash.clone().into(),
            new_user.phone.clone().into(),
            new_user.state.clone().into(),
            home_folder.into(),
            new_user.role.as_str().into(),
            now.into(),
            now.into(),
        ],
    )?;

    info!(company_id, user_id = id, role = %new_user.role, "created user");
    get_by_id(conn, company_id, id)?.ok_or_else(|| StoreError::not_found(format!("user {id}")))
}

pub fn get_by_id(conn: &mut Conn<'_>, company_id: i64, id: i64) -> StoreResult<Option<User>> {
    let row: Option<UserRow> = conn.query_opt(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE company_id = $1 AND id = $2"),
        &[company_id.into(), id.into()],
    )?;
    row.map(User::try_from).transpose()
}

pub fn get_by_email(conn: &mut Conn<'_>, company_id: i64, email: &str) -> StoreResult<Option<User>> {
    let row: Option<UserRow> = conn.query_opt(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE company_id = $1 AND email = $2"),
        &[company_id.into(), email.trim().to_ascii_lowercase().into()],
    )?;
    row.map(User::try_from).transpose()
}

pub fn list(conn: &mut Conn<'_>, company_id: i64) -> StoreResult<Vec<User>> {
    let rows = conn.query::<UserRow>(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE company_id = $1 ORDER BY id"),
        &[company_id.into()],
    )?;
    rows.rows.into_iter().map(User::try_from).collect()
}

/// Every user, optionally limited to one company, ordered by company then id.
pub fn list_all(conn: &mut Conn<'_>, company_id: Option<i64>) -> StoreResult<Vec<User>> {
    let rows = match company_id {
        Some(company_id) => conn.query::<UserRow>(
            &format!(
                "SELECT {USER_COLUMNS} FROM users WHERE company_id = $1 ORDER BY company_id, id"
            ),
            &[company_id.into()],
        )?,
        None => conn.query::<UserRow>(
            &format!("SELECT {USER_COLUMNS} FROM users ORDER BY company_id, id"),
            &[],
        )?,
    };
    rows.rows.into_iter().map(User::try_from).collect()
}

pub fn count_admins(conn: &mut Conn<'_>, company_id: i64) -> StoreResult<i64> {
    conn.count(
        "SELECT COUNT(*) AS count FROM users WHERE company_id = $1 AND role = 'admin'",
        &[company_id.into()],
    )
}

pub fn update(
    conn: &mut Conn<'_>,
    company_id: i64,
    id: i64,
    changes: &UserUpdate,
) -> StoreResult<User> {
    conn.transaction(|tx| {
        let current = get_by_id(tx, company_id, id)?
            .ok_or_else(|| StoreError::not_found(format!("user {id}")))?;

        let role = changes.role.unwrap_or(current.role);
        if current.is_admin() && role != UserRole::Admin && count_admins(tx, company_id)? <= 1 {
            return Err(StoreError::invariant(format!(
                "company {company_id} must keep at least one admin"
            )));
        }

        // Role changes re-derive the home folder even when none was supplied.
        let home_folder = match (&changes.home_folder, changes.role) {
            (Some(folder), _) => Some(normalize_home_folder(role, folder)?),
            (None, Some(_)) => Some(normalize_home_folder(role, &current.home_folder)?),
            (None, None) => None,
        };

        let mut assignments = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();
        let mut assign = |column: &str, value: SqlParam| {
            params.push(value);
            assignments.push(format!("{column} = ${}", params.len()));
        };

        if let Some(email) = &changes.email {
            assign("email", normalize_email(email)?.into());
        }
        if let Some(name) = &changes.name {
            assign("name", name.trim().into());
        }
        if let Some(password_hash) = &changes.password_hash {
            assign("password_hash", password_hash.clone().into());
        }
        if let Some(phone) = &changes.phone {
            assign("phone", phone.clone().into());
        }
        if let Some(state) = &changes.state {
            assign("state", state.clone().into());
        }
        if let Some(home_folder) = home_folder {
            assign("home_folder", home_folder.into());
        }
        if let Some(role) = changes.role {
            assign("role", role.as_str().into());
        }
        assign("updated_at", Utc::now().naive_utc().into());

        params.push(company_id.into());
        params.push(id.into());
        let sql = format!(
            "UPDATE users SET {} WHERE company_id = ${} AND id = ${}",
            assignments.join(", "),
            params.len() - 1,
            params.len()
        );
        tx.execute(&sql, &params)?;

        get_by_id(tx, company_id, id)?.ok_or_else(|| StoreError::not_found(format!("user {id}")))
    })
}

/// Deletes a user. The last admin of a company cannot be deleted.
pub fn delete(conn: &mut Conn<'_>, company_id: i64, id: i64) -> StoreResult<bool> {
    conn.transaction(|tx| {
        let Some(user) = get_by_id(tx, company_id, id)? else {
            return Ok(false);
        };
        if user.is_admin() && count_admins(tx, company_id)? <= 1 {
            return Err(StoreError::invariant(format!(
                "company {company_id} must keep at least one admin"
            )));
        }
        tx.execute(
            "DELETE FROM users WHERE company_id = $1 AND id = $2",
            &[company_id.into(), id.into()],
        )?;
        Ok(true)
    })
}

/// Inserts a user row keeping the id from the snapshot.
pub fn insert_with_id(conn: &mut Conn<'_>, company_id: i64, user: &SnapshotUser) -> StoreResult<()> {
    let now = Utc::now().naive_utc();
    let home_folder = normalize_home_folder(user.role, &user.home_folder)?;
    conn.execute(
        &format!(
            "INSERT INTO users ({USER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ),
        &[
            company_id.into(),
            user.id.into(),
            user.email.trim().to_ascii_lowercase().into(),
            user.name.clone().into(),
            user.password_hash.clone().into(),
            user.phone.clone().into(),
            user.state.clone().into(),
            home_folder.into(),
            user.role.as_str().into(),
            user.created_at.unwrap_or(now).into(),
            user.updated_at.unwrap_or(now).into(),
        ],
    )?;
    Ok(())
}

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::adapter::{Conn, SqlParam};
use crate::error::{StoreError, StoreResult};
use crate::ids::{self, IdTable};
use crate::models::{Document, DocumentUpdate, FileRow, FileType, NewDocument};
use crate::snapshot::SnapshotDocument;

const FILE_COLUMNS: &str = "company_id, id, name, path, type AS file_type, content, \
                            file_references, created_at, updated_at";

/// Unlimited listing depth.
pub const ANY_DEPTH: i32 = -1;

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only paths strictly below this folder. `None` lists the whole company.
    pub path_prefix: Option<String>,
    /// 1 returns direct children, N returns up to N levels, -1 (or `None`)
    /// returns every descendant.
    pub depth: Option<i32>,
    pub file_type: Option<FileType>,
}

pub(crate) fn check_path(path: &str) -> StoreResult<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) {
        return Err(StoreError::invalid(format!(
            "document path must be absolute without a trailing slash, got {path:?}"
        )));
    }
    if path.split('/').skip(1).any(|segment| segment.is_empty() || segment == "..") {
        return Err(StoreError::invalid(format!("malformed document path {path:?}")));
    }
    Ok(())
}

fn encode_content(content: &Value) -> StoreResult<String> {
    if content.is_null() {
        return Err(StoreError::invalid("document content must not be null"));
    }
    Ok(serde_json::to_string(content)?)
}

fn encode_references(references: &[i64]) -> StoreResult<String> {
    Ok(serde_json::to_string(references)?)
}

pub fn create(conn: &mut Conn<'_>, company_id: i64, new_doc: &NewDocument) -> StoreResult<Document> {
    check_path(&new_doc.path)?;
    let content = encode_content(&new_doc.content)?;
    let references = encode_references(&new_doc.references)?;
    let now = Utc::now().naive_utc();

    let id = ids::insert_with_next_id(
        conn,
        IdTable::Files,
        company_id,
        &[
            "name",
            "path",
            "type",
            "content",
            "file_references",
            "created_at",
            "updated_at",
        ],
        vec![
            new_doc.name.clone().into(),
            new_doc.path.clone().into(),
            new_doc.file_type.as_str().into(),
            content.into(),
            references.into(),
            now.into(),
            now.into(),
        ],
    )?;

    info!(company_id, file_id = id, file_type = %new_doc.file_type, "created document");
    get_by_id(conn, company_id, id)?.ok_or_else(|| StoreError::not_found(format!("document {id}")))
}

pub fn get_by_id(conn: &mut Conn<'_>, company_id: i64, id: i64) -> StoreResult<Option<Document>> {
    let row: Option<FileRow> = conn.query_opt(
        &format!("SELECT {FILE_COLUMNS} FROM files WHERE company_id = $1 AND id = $2"),
        &[company_id.into(), id.into()],
    )?;
    row.map(Document::try_from).transpose()
}

pub fn get_by_path(conn: &mut Conn<'_>, company_id: i64, path: &str) -> StoreResult<Option<Document>> {
    let row: Option<FileRow> = conn.query_opt(
        &format!("SELECT {FILE_COLUMNS} FROM files WHERE company_id = $1 AND path = $2"),
        &[company_id.into(), path.into()],
    )?;
    row.map(Document::try_from).transpose()
}

/// Loads the documents among `ids` that exist, ordered by id.
pub fn get_by_ids(conn: &mut Conn<'_>, company_id: i64, ids: &[i64]) -> StoreResult<Vec<Document>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut params: Vec<SqlParam> = vec![company_id.into()];
    params.extend(ids.iter().map(|id| SqlParam::Int(*id)));
    let sql = format!(
        "SELECT {FILE_COLUMNS} FROM files WHERE company_id = $1 AND id IN ({}) ORDER BY id",
        placeholders(2, ids.len())
    );
    let rows = conn.query::<FileRow>(&sql, &params)?;
    rows.rows.into_iter().map(Document::try_from).collect()
}

pub fn list(conn: &mut Conn<'_>, company_id: i64, filter: &ListFilter) -> StoreResult<Vec<Document>> {
    let mut clauses = vec!["company_id = $1".to_string()];
    let mut params: Vec<SqlParam> = vec![company_id.into()];

    let prefix = filter
        .path_prefix
        .as_deref()
        .map(|prefix| prefix.trim_end_matches('/').to_string());
    if let Some(prefix) = &prefix {
        params.push(format!("{}/%", escape_like(prefix)).into());
        clauses.push(format!("path LIKE ${} ESCAPE '\\'", params.len()));
    }
    if let Some(file_type) = filter.file_type {
        params.push(file_type.as_str().into());
        clauses.push(format!("type = ${}", params.len()));
    }

    let sql = format!(
        "SELECT {FILE_COLUMNS} FROM files WHERE {} ORDER BY path",
        clauses.join(" AND ")
    );
    let rows = conn.query::<FileRow>(&sql, &params)?;

    let depth = filter.depth.unwrap_or(ANY_DEPTH);
    let mut documents = Vec::with_capacity(rows.row_count);
    for row in rows.rows {
        let document = Document::try_from(row)?;
        if within_depth(prefix.as_deref().unwrap_or(""), &document.path, depth) {
            documents.push(document);
        }
    }
    Ok(documents)
}

/// Whether `path` lies at most `depth` levels below `prefix`.
pub fn within_depth(prefix: &str, path: &str, depth: i32) -> bool {
    let Some(rest) = path.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('/')) else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }
    if depth < 0 {
        return true;
    }
    let level = rest.matches('/').count() as i32 + 1;
    level <= depth
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|index| format!("${index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn update(
    conn: &mut Conn<'_>,
    company_id: i64,
    id: i64,
    changes: &DocumentUpdate,
) -> StoreResult<Document> {
    let mut assignments = Vec::new();
    let mut params: Vec<SqlParam> = Vec::new();

    if let Some(name) = &changes.name {
        params.push(name.clone().into());
        assignments.push(format!("name = ${}", params.len()));
    }
    if let Some(path) = &changes.path {
        check_path(path)?;
        params.push(path.clone().into());
        assignments.push(format!("path = ${}", params.len()));
    }
    if let Some(content) = &changes.content {
        params.push(encode_content(content)?.into());
        assignments.push(format!("content = ${}", params.len()));
    }
    if let Some(references) = &changes.references {
        params.push(encode_references(references)?.into());
        assignments.push(format!("file_references = ${}", params.len()));
    }
    params.push(Utc::now().naive_utc().into());
    assignments.push(format!("updated_at = ${}", params.len()));

    params.push(company_id.into());
    params.push(id.into());
    let sql = format!(
        "UPDATE files SET {} WHERE company_id = ${} AND id = ${}",
        assignments.join(", "),
        params.len() - 1,
        params.len()
    );

    if conn.execute(&sql, &params)? == 0 {
        return Err(StoreError::not_found(format!("document {id}")));
    }
    get_by_id(conn, company_id, id)?.ok_or_else(|| StoreError::not_found(format!("document {id}")))
}

/// Applies many updates in one statement. The outcome matches applying them
/// one by one in order: repeated ids are folded so later fields win.
pub fn bulk_update(
    conn: &mut Conn<'_>,
    company_id: i64,
    updates: Vec<(i64, DocumentUpdate)>,
) -> StoreResult<Vec<Document>> {
    let mut merged: BTreeMap<i64, DocumentUpdate> = BTreeMap::new();
    for (id, update) in updates {
        merged.entry(id).or_default().merge(update);
    }
    merged.retain(|_, update| !update.is_empty());
    if merged.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = merged.keys().copied().collect();
    let mut params: Vec<SqlParam> = vec![company_id.into()];
    let mut assignments = Vec::new();

    let mut column_case = |column: &str, values: Vec<(i64, SqlParam)>, params: &mut Vec<SqlParam>| {
        if values.is_empty() {
            return;
        }
        let mut case = format!("{column} = CASE id");
        for (id, value) in values {
            params.push(id.into());
            let id_slot = params.len();
            params.push(value);
            case.push_str(&format!(" WHEN ${id_slot} THEN ${}", params.len()));
        }
        case.push_str(&format!(" ELSE {column} END"));
        assignments.push(case);
    };

    let mut names = Vec::new();
    let mut paths = Vec::new();
    let mut contents = Vec::new();
    let mut references = Vec::new();
    for (id, update) in &merged {
        if let Some(name) = &update.name {
            names.push((*id, SqlParam::from(name.clone())));
        }
        if let Some(path) = &update.path {
            check_path(path)?;
            paths.push((*id, SqlParam::from(path.clone())));
        }
        if let Some(content) = &update.content {
            contents.push((*id, SqlParam::from(encode_content(content)?)));
        }
        if let Some(refs) = &update.references {
            references.push((*id, SqlParam::from(encode_references(refs)?)));
        }
    }
    column_case("name", names, &mut params);
    column_case("path", paths, &mut params);
    column_case("content", contents, &mut params);
    column_case("file_references", references, &mut params);

    params.push(Utc::now().naive_utc().into());
    assignments.push(format!("updated_at = ${}", params.len()));

    let first_id = params.len() + 1;
    params.extend(ids.iter().map(|id| SqlParam::Int(*id)));
    let sql = format!(
        "UPDATE files SET {} WHERE company_id = $1 AND id IN ({})",
        assignments.join(", "),
        placeholders(first_id, ids.len())
    );

    conn.transaction(|tx| {
        let affected = tx.execute(&sql, &params)?;
        if affected != ids.len() {
            return Err(StoreError::not_found(format!(
                "{} of {} documents missing in company {company_id}",
                ids.len() - affected,
                ids.len()
            )));
        }
        debug!(company_id, count = affected, "bulk updated documents");
        get_by_ids(tx, company_id, &ids)
    })
}

/// Deletes a document and the access tokens pointing at it. The last
/// connection of a company cannot be deleted.
pub fn delete(conn: &mut Conn<'_>, company_id: i64, id: i64) -> StoreResult<bool> {
    conn.transaction(|tx| {
        let Some(document) = get_by_id(tx, company_id, id)? else {
            return Ok(false);
        };
        if document.file_type == FileType::Connection && count_connections(tx, company_id)? <= 1 {
            return Err(StoreError::invariant(format!(
                "company {company_id} must keep at least one connection"
            )));
        }
        tx.execute(
            "DELETE FROM access_tokens WHERE company_id = $1 AND file_id = $2",
            &[company_id.into(), id.into()],
        )?;
        tx.execute(
            "DELETE FROM files WHERE company_id = $1 AND id = $2",
            &[company_id.into(), id.into()],
        )?;
        Ok(true)
    })
}

pub fn count_connections(conn: &mut Conn<'_>, company_id: i64) -> StoreResult<i64> {
    conn.count(
        "SELECT COUNT(*) AS count FROM files WHERE company_id = $1 AND type = 'connection'",
        &[company_id.into()],
    )
}

pub fn list_all(conn: &mut Conn<'_>, company_id: Option<i64>) -> StoreResult<Vec<Document>> {
    let rows = match company_id {
        Some(company_id) => conn.query::<FileRow>(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE company_id = $1 ORDER BY company_id, id"
            ),
            &[company_id.into()],
        )?,
        None => conn.query::<FileRow>(
            &format!("SELECT {FILE_COLUMNS} FROM files ORDER BY company_id, id"),
            &[],
        )?,
    };
    rows.rows.into_iter().map(Document::try_from).collect()
}

/// Inserts a document row keeping the id from the snapshot.
pub fn insert_with_id(
    conn: &mut Conn<'_>,
    company_id: i64,
    document: &SnapshotDocument,
) -> StoreResult<()> {
    check_path(&document.path)?;
    let now = Utc::now().naive_utc();
    conn.execute(
        "INSERT INTO files (company_id, id, name, path, type, content, file_references, \
         created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        &[
            company_id.into(),
            document.id.into(),
            document.name.clone().into(),
            document.path.clone().into(),
            document.file_type.as_str().into(),
            encode_content(&document.content)?.into(),
            encode_references(&document.references)?.into(),
            document.created_at.unwrap_or(now).into(),
            document.updated_at.unwrap_or(now).into(),
        ],
    )?;
    Ok(())
}

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::adapter::Conn;
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::migrations::LATEST_DATA_VERSION;
use crate::snapshot::{CompanyBundle, Snapshot};
use crate::stores::{access_tokens, companies, documents, settings, users};

/// Reads the database, or one company of it, into a snapshot sorted by id.
pub fn export_snapshot(conn: &mut Conn<'_>, company_id: Option<i64>) -> StoreResult<Snapshot> {
    let version = settings::data_version(conn)?.unwrap_or(LATEST_DATA_VERSION);

    let rows = match company_id {
        Some(id) => vec![companies::get_by_id(conn, id)?
            .ok_or_else(|| StoreError::not_found(format!("company {id}")))?],
        None => companies::list(conn)?,
    };
    let mut bundles: BTreeMap<i64, CompanyBundle> = rows
        .into_iter()
        .map(|company| (company.id, CompanyBundle::from_company(company)))
        .collect();

    for user in users::list_all(conn, company_id)? {
        match bundles.get_mut(&user.company_id) {
            Some(bundle) => bundle.users.push(user.into()),
            None => warn!(company_id = user.company_id, user_id = user.id, "skipping orphaned user"),
        }
    }
    for document in documents::list_all(conn, company_id)? {
        match bundles.get_mut(&document.company_id) {
            Some(bundle) => bundle.documents.push(document.into()),
            None => warn!(
                company_id = document.company_id,
                file_id = document.id,
                "skipping orphaned document"
            ),
        }
    }
    for token in access_tokens::list_all(conn, company_id)? {
        if let Some(bundle) = bundles.get_mut(&token.company_id) {
            bundle.access_tokens.push(token);
        }
    }

    let mut snapshot = Snapshot {
        version,
        companies: bundles.into_values().collect(),
    };
    snapshot.sort();
    Ok(snapshot)
}

/// Exports inside one read transaction so the snapshot is consistent.
pub async fn export_database(db: &Database, company_id: Option<i64>) -> StoreResult<Snapshot> {
    db.ensure_schema().await?;
    let snapshot = db
        .transaction(move |conn| export_snapshot(conn, company_id))
        .await?;
    info!(
        version = snapshot.version,
        companies = snapshot.companies.len(),
        company_id = ?company_id,
        "exported snapshot"
    );
    Ok(snapshot)
}

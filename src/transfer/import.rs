use tracing::{error, info, warn};

use crate::adapter::{Conn, Dialect};
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::migrations::{self, LATEST_DATA_VERSION, LATEST_SCHEMA_VERSION};
use crate::schema::{self, INITIAL_VERSION};
use crate::snapshot::{CompanyBundle, Snapshot};
use crate::stores::{access_tokens, companies, documents, settings, users};
use crate::transfer::{export::export_database, swap};
use crate::validation::{self, ValidationReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportMode {
    /// Replace the whole database.
    ReplaceAll,
    /// Replace only these companies and leave the rest untouched.
    Companies(Vec<i64>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub companies: usize,
    pub users: usize,
    pub documents: usize,
    pub access_tokens: usize,
    pub applied_migrations: Vec<&'static str>,
    pub warnings: Vec<String>,
}

impl ImportReport {
    fn add_bundle(&mut self, bundle: &CompanyBundle) {
        self.companies += 1;
        self.users += bundle.users.len();
        self.documents += bundle.documents.len();
        self.access_tokens += bundle.access_tokens.len();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRun {
    pub from_data_version: i64,
    pub from_schema_version: i64,
    pub applied: Vec<&'static str>,
    pub recreated_schema: bool,
}

/// Migrates `snapshot` to the latest version and writes it according to
/// `mode`. Full replacement is all or nothing on both backends.
pub async fn import_snapshot(
    db: &Database,
    snapshot: Snapshot,
    mode: ImportMode,
) -> StoreResult<ImportReport> {
    let outcome = migrations::migrate(snapshot)?;
    let mut snapshot = outcome.snapshot;

    let mut report = match mode {
        ImportMode::ReplaceAll => {
            let validation = require_valid(validation::validate(&snapshot))?;
            let mut report = match db.dialect() {
                Dialect::Postgres => replace_postgres(db, snapshot).await?,
                Dialect::Sqlite => swap::replace_sqlite(db, snapshot).await?,
            };
            report.warnings = validation.warnings;
            report
        }
        ImportMode::Companies(ids) => {
            for id in &ids {
                if snapshot.company(*id).is_none() {
                    return Err(StoreError::invalid(format!(
                        "company {id} is not part of the snapshot"
                    )));
                }
            }
            snapshot.retain_companies(&ids);
            let validation = require_valid(validation::validate(&snapshot))?;
            let mut report = replace_companies(db, snapshot, ids).await?;
            report.warnings.extend(validation.warnings);
            report
        }
    };
    report.applied_migrations = outcome.applied;
    Ok(report)
}

fn require_valid(report: ValidationReport) -> StoreResult<ValidationReport> {
    if report.valid {
        Ok(report)
    } else {
        for message in &report.errors {
            warn!(error = %message, "snapshot rejected");
        }
        Err(StoreError::Validation(report))
    }
}

/// Inserts every bundle of `snapshot`. Company ids and per-company ids are
/// kept as they appear in the snapshot.
pub(super) fn insert_snapshot(conn: &mut Conn<'_>, snapshot: &Snapshot) -> StoreResult<ImportReport> {
    let mut report = ImportReport::default();
    for bundle in &snapshot.companies {
        insert_bundle(conn, bundle)?;
        report.add_bundle(bundle);
    }
    companies::reset_sequence(conn)?;
    Ok(report)
}

fn insert_bundle(conn: &mut Conn<'_>, bundle: &CompanyBundle) -> StoreResult<()> {
    companies::insert_with_id(conn, bundle)?;
    for user in &bundle.users {
        users::insert_with_id(conn, bundle.id, user)?;
    }
    for document in &bundle.documents {
        documents::insert_with_id(conn, bundle.id, document)?;
    }
    for token in &bundle.access_tokens {
        access_tokens::insert(conn, token)?;
    }
    Ok(())
}

fn delete_everything(conn: &mut Conn<'_>) -> StoreResult<()> {
    conn.exec(
        "DELETE FROM access_tokens; DELETE FROM files; DELETE FROM users; DELETE FROM companies;",
    )
}

async fn replace_postgres(db: &Database, snapshot: Snapshot) -> StoreResult<ImportReport> {
    db.ensure_schema().await?;
    let report = db
        .transaction(move |tx| {
            let stored_schema = settings::schema_version(tx)?.unwrap_or(INITIAL_VERSION);
            if migrations::needs_schema_migration(stored_schema) {
                info!(stored_schema, "recreating schema");
                schema::drop_all(tx)?;
                schema::initialize(tx)?;
            } else {
                delete_everything(tx)?;
            }
            let report = insert_snapshot(tx, &snapshot)?;
            settings::set_versions(tx, LATEST_DATA_VERSION, LATEST_SCHEMA_VERSION)?;
            Ok(report)
        })
        .await?;

    info!(
        companies = report.companies,
        users = report.users,
        documents = report.documents,
        "replaced postgres database"
    );
    Ok(report)
}

async fn replace_companies(
    db: &Database,
    snapshot: Snapshot,
    ids: Vec<i64>,
) -> StoreResult<ImportReport> {
    db.ensure_schema().await?;
    let report = db
        .transaction(move |tx| {
            let stored = settings::data_version(tx)?.unwrap_or(INITIAL_VERSION);
            if migrations::needs_data_migration(stored) {
                return Err(StoreError::invariant(format!(
                    "database is at data version {stored}; run migrations before a partial import"
                )));
            }
            for id in &ids {
                tx.execute("DELETE FROM access_tokens WHERE company_id = $1", &[(*id).into()])?;
                tx.execute("DELETE FROM files WHERE company_id = $1", &[(*id).into()])?;
                tx.execute("DELETE FROM users WHERE company_id = $1", &[(*id).into()])?;
                tx.execute("DELETE FROM companies WHERE id = $1", &[(*id).into()])?;
            }
            insert_snapshot(tx, &snapshot)
        })
        .await?;
    info!(
        companies = report.companies,
        users = report.users,
        documents = report.documents,
        "replaced companies"
    );

    // Already committed: a failure here means the database needs attention.
    let exported = export_database(db, None).await?;
    let after = validation::validate(&exported);
    if !after.valid {
        error!(
            errors = after.errors.len(),
            "database failed validation after partial import"
        );
        return Err(StoreError::Validation(after));
    }
    Ok(report)
}

/// Brings a live database to the latest data and schema version by
/// exporting it, migrating the snapshot and importing it over itself.
pub async fn run_migrations(db: &Database) -> StoreResult<MigrationRun> {
    migrations::check_registry_order(migrations::registry())?;
    db.ensure_schema().await?;
    let (data_version, schema_version) = db
        .run(|conn| {
            Ok((
                settings::data_version(conn)?.unwrap_or(INITIAL_VERSION),
                settings::schema_version(conn)?.unwrap_or(INITIAL_VERSION),
            ))
        })
        .await?;

    let recreate = migrations::needs_schema_migration(schema_version);
    if !migrations::needs_data_migration(data_version) && !recreate {
        info!(data_version, schema_version, "database is up to date");
        return Ok(MigrationRun {
            from_data_version: data_version,
            from_schema_version: schema_version,
            applied: Vec::new(),
            recreated_schema: false,
        });
    }

    info!(data_version, schema_version, "migrating database");
    let snapshot = export_database(db, None).await?;
    let report = import_snapshot(db, snapshot, ImportMode::ReplaceAll).await?;
    Ok(MigrationRun {
        from_data_version: data_version,
        from_schema_version: schema_version,
        applied: report.applied_migrations,
        recreated_schema: recreate,
    })
}

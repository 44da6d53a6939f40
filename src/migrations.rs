//! Versioned snapshot migrations.
//!
//! Every migration bumps the data version, the schema version, or both. Data
//! transforms are pure functions over a [`Snapshot`]. Schema changes are
//! never applied in place: a database whose stored schema version is behind
//! a [`SchemaChange::Recreate`] entry is exported, migrated and imported into
//! a freshly built schema.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::models::{UserRole, ORG_ROOT};
use crate::snapshot::Snapshot;
use crate::stores::users::normalize_home_folder;

pub const LATEST_DATA_VERSION: i64 = 6;
pub const LATEST_SCHEMA_VERSION: i64 = 6;

/// Home folder given to non-admins whose legacy folder pointed outside the
/// company root.
pub const QUARANTINE_HOME_FOLDER: &str = "quarantine";

/// From this data version on, non-admin home folders are relative and stay
/// below the company root.
pub const HOME_FOLDERS_NORMALIZED_VERSION: i64 = 2;

/// From this data version on, document paths live under the org root.
pub const ORG_ROOTED_VERSION: i64 = 3;

/// From this data version on, every company carries a subdomain.
pub const SUBDOMAIN_REQUIRED_VERSION: i64 = 6;

pub type Transform = fn(Snapshot) -> Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChange {
    Recreate,
}

#[derive(Debug, Clone, Copy)]
pub enum MigrationKind {
    Data(Transform),
    Schema(SchemaChange),
    DataAndSchema {
        transform: Transform,
        change: SchemaChange,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub data_version: Option<i64>,
    pub schema_version: Option<i64>,
    pub kind: MigrationKind,
}

impl Migration {
    pub fn transform(&self) -> Option<Transform> {
        match self.kind {
            MigrationKind::Data(transform) | MigrationKind::DataAndSchema { transform, .. } => {
                Some(transform)
            }
            MigrationKind::Schema(_) => None,
        }
    }

    pub fn schema_change(&self) -> Option<SchemaChange> {
        match self.kind {
            MigrationKind::Schema(change) | MigrationKind::DataAndSchema { change, .. } => {
                Some(change)
            }
            MigrationKind::Data(_) => None,
        }
    }

    /// Whether this migration still has to run on a snapshot at `version`.
    pub fn applies_to(&self, version: i64) -> bool {
        self.data_version.is_some_and(|target| target > version)
    }
}

static REGISTRY: &[Migration] = &[
    Migration {
        name: "normalize_home_folders",
        data_version: Some(HOME_FOLDERS_NORMALIZED_VERSION),
        schema_version: None,
        kind: MigrationKind::Data(normalize_home_folders),
    },
    Migration {
        name: "root_paths_under_org",
        data_version: Some(ORG_ROOTED_VERSION),
        schema_version: None,
        kind: MigrationKind::Data(root_paths_under_org),
    },
    Migration {
        name: "recreate_access_tokens",
        data_version: Some(4),
        schema_version: Some(4),
        kind: MigrationKind::Schema(SchemaChange::Recreate),
    },
    Migration {
        name: "collapse_repeated_org_prefix",
        data_version: Some(5),
        schema_version: None,
        kind: MigrationKind::Data(collapse_repeated_org_prefix),
    },
    Migration {
        name: "backfill_subdomains",
        data_version: Some(SUBDOMAIN_REQUIRED_VERSION),
        schema_version: Some(6),
        kind: MigrationKind::DataAndSchema {
            transform: backfill_subdomains,
            change: SchemaChange::Recreate,
        },
    },
];

pub fn registry() -> &'static [Migration] {
    REGISTRY
}

/// Checks that data and schema versions never decrease along `migrations`
/// and that nothing targets a version past the latest constants.
pub fn check_registry_order(migrations: &[Migration]) -> StoreResult<()> {
    let mut last_data = 0;
    let mut last_schema = 0;
    for migration in migrations {
        if migration.data_version.is_none() && migration.schema_version.is_none() {
            return Err(StoreError::invariant(format!(
                "migration {} has no target version",
                migration.name
            )));
        }
        if let Some(version) = migration.data_version {
            if version < last_data || version > LATEST_DATA_VERSION {
                return Err(StoreError::invariant(format!(
                    "migration {} targets data version {version} out of order",
                    migration.name
                )));
            }
            last_data = version;
        }
        if let Some(version) = migration.schema_version {
            if version < last_schema || version > LATEST_SCHEMA_VERSION {
                return Err(StoreError::invariant(format!(
                    "migration {} targets schema version {version} out of order",
                    migration.name
                )));
            }
            last_schema = version;
        }
        if migration.schema_change().is_some() && migration.schema_version.is_none() {
            return Err(StoreError::invariant(format!(
                "migration {} changes the schema without a schema version",
                migration.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub snapshot: Snapshot,
    pub applied: Vec<&'static str>,
}

/// Brings `snapshot` to [`LATEST_DATA_VERSION`]. Running it again on the
/// result applies nothing.
pub fn migrate(snapshot: Snapshot) -> StoreResult<MigrationOutcome> {
    migrate_with(registry(), snapshot)
}

pub fn migrate_with(migrations: &[Migration], mut snapshot: Snapshot) -> StoreResult<MigrationOutcome> {
    check_registry_order(migrations)?;
    if snapshot.version > LATEST_DATA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: snapshot.version,
            latest: LATEST_DATA_VERSION,
        });
    }

    let mut applied = Vec::new();
    for migration in migrations {
        if !migration.applies_to(snapshot.version) {
            continue;
        }
        let Some(target) = migration.data_version else {
            continue;
        };
        if let Some(transform) = migration.transform() {
            snapshot = transform(snapshot);
        }
        info!(
            migration = migration.name,
            from = snapshot.version,
            to = target,
            "applied data migration"
        );
        snapshot.version = target;
        applied.push(migration.name);
    }

    Ok(MigrationOutcome { snapshot, applied })
}

pub fn needs_data_migration(stored_data_version: i64) -> bool {
    stored_data_version < LATEST_DATA_VERSION
}

/// True when a schema recreation registered after `stored_schema_version`
/// has not yet been applied to the database.
pub fn needs_schema_migration(stored_schema_version: i64) -> bool {
    registry().iter().any(|migration| {
        migration.schema_change() == Some(SchemaChange::Recreate)
            && migration
                .schema_version
                .is_some_and(|version| version > stored_schema_version)
    })
}

fn normalize_home_folders(mut snapshot: Snapshot) -> Snapshot {
    for user in snapshot
        .companies
        .iter_mut()
        .flat_map(|bundle| bundle.users.iter_mut())
    {
        user.home_folder = match user.role {
            UserRole::Admin => String::new(),
            role => {
                let relative = user.home_folder.trim().trim_matches('/');
                match normalize_home_folder(role, relative) {
                    Ok(folder) => folder,
                    Err(_) => {
                        let folder = confine_home_folder(relative);
                        warn!(
                            user_id = user.id,
                            original = %user.home_folder,
                            home_folder = %folder,
                            "home folder escaped the company root; confined"
                        );
                        folder
                    }
                }
            }
        };
    }
    snapshot
}

/// Drops dot segments so the folder stays below the company root. Never
/// widens to the root itself.
fn confine_home_folder(relative: &str) -> String {
    let segments: Vec<&str> = relative
        .split('/')
        .filter(|segment| !matches!(*segment, "" | "." | ".."))
        .collect();
    if segments.is_empty() {
        QUARANTINE_HOME_FOLDER.to_string()
    } else {
        segments.join("/")
    }
}

fn root_paths_under_org(mut snapshot: Snapshot) -> Snapshot {
    for document in snapshot
        .companies
        .iter_mut()
        .flat_map(|bundle| bundle.documents.iter_mut())
    {
        if is_under_org(&document.path) {
            continue;
        }
        let relative = document.path.trim_start_matches('/');
        document.path = if relative.is_empty() {
            ORG_ROOT.to_string()
        } else {
            format!("{ORG_ROOT}/{relative}")
        };
    }
    snapshot
}

fn is_under_org(path: &str) -> bool {
    path == ORG_ROOT || path.starts_with(&format!("{ORG_ROOT}/"))
}

/// Repairs paths that went through the `/org` rooting more than once.
fn collapse_repeated_org_prefix(mut snapshot: Snapshot) -> Snapshot {
    let doubled = format!("{ORG_ROOT}{ORG_ROOT}");
    for document in snapshot
        .companies
        .iter_mut()
        .flat_map(|bundle| bundle.documents.iter_mut())
    {
        while let Some(rest) = document.path.strip_prefix(&doubled) {
            if !rest.is_empty() && !rest.starts_with('/') {
                break;
            }
            document.path = format!("{ORG_ROOT}{rest}");
        }
    }
    snapshot
}

fn backfill_subdomains(mut snapshot: Snapshot) -> Snapshot {
    let mut taken: HashSet<String> = snapshot
        .companies
        .iter()
        .filter_map(|bundle| bundle.subdomain.as_deref())
        .map(|subdomain| subdomain.trim().to_ascii_lowercase())
        .filter(|subdomain| !subdomain.is_empty())
        .collect();

    for bundle in &mut snapshot.companies {
        if bundle
            .subdomain
            .as_deref()
            .is_some_and(|subdomain| !subdomain.trim().is_empty())
        {
            continue;
        }
        let base = match slugify(&bundle.name) {
            slug if slug.is_empty() => format!("company-{}", bundle.id),
            slug => slug,
        };
        let mut candidate = base.clone();
        let mut attempt = 1;
        while taken.contains(&candidate) {
            candidate = if attempt == 1 {
                format!("{base}-{}", bundle.id)
            } else {
                format!("{base}-{}-{attempt}", bundle.id)
            };
            attempt += 1;
        }
        taken.insert(candidate.clone());
        bundle.subdomain = Some(candidate);
    }
    snapshot
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let mut slug: String = slug.chars().take(50).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

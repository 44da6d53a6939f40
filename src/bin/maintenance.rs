use std::env;
use std::fs;
use std::io::{self, Read, Write};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use docvault::{
    config::AppConfig,
    probe::{ensure_server_offline, HttpHealthProbe},
    transfer::{export_database, import_snapshot, run_migrations, ImportMode},
    validation::{structural_errors, validate_value, ValidationReport},
    Database, Snapshot, StoreError,
};

const USAGE: &str = "Usage:
  maintenance export [--company=ID]
  maintenance import [--file=PATH|-] [--companies=ID,ID] --replace-db=y|n
  maintenance validate < snapshot.json
  maintenance migrate";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    let command = args.next();
    let rest: Vec<String> = args.collect();
    match command.as_deref() {
        Some("export") => export(&rest).await?,
        Some("import") => import(&rest).await?,
        Some("validate") => {
            if !validate_stdin()? {
                std::process::exit(1);
            }
        }
        Some("migrate") => migrate().await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

/// Value of `--name=value`, if present.
fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    let prefix = format!("--{name}=");
    args.iter().find_map(|arg| arg.strip_prefix(&prefix))
}

fn check_flags(args: &[String], known: &[&str]) -> Result<()> {
    for arg in args {
        let name = arg
            .strip_prefix("--")
            .and_then(|flag| flag.split('=').next())
            .unwrap_or_default();
        if !known.contains(&name) {
            bail!("unexpected argument {arg}\n{USAGE}");
        }
    }
    Ok(())
}

async fn open_database() -> Result<Database> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        db_type = config.db_type.as_str(),
        location = %config.redacted_location(),
        pool_size = config.database_max_pool_size,
        "loaded configuration"
    );

    let probe = HttpHealthProbe::new(&config.server_url, config.health_probe_timeout)?;
    ensure_server_offline(config.db_type, &probe).await?;

    let db = Database::connect(&config.database_config()?)
        .await
        .context("failed to open database")?;
    Ok(db)
}

async fn export(args: &[String]) -> Result<()> {
    check_flags(args, &["company"])?;
    let company = flag(args, "company")
        .map(|raw| raw.parse::<i64>().context("--company must be an integer"))
        .transpose()?;

    let db = open_database().await?;
    let snapshot = export_database(&db, company)
        .await
        .context("failed to export database")?;
    db.close().await?;

    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &snapshot)?;
    writeln!(stdout)?;
    Ok(())
}

fn parse_company_list(raw: &str) -> Result<Vec<i64>> {
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| id.parse::<i64>().with_context(|| format!("invalid company id {id:?}")))
        .collect::<Result<Vec<_>>>()?;
    if ids.is_empty() {
        bail!("--companies needs at least one id");
    }
    Ok(ids)
}

fn import_mode(companies: Option<&str>, replace_db: Option<&str>) -> Result<ImportMode> {
    let replace = match replace_db {
        Some("y") => true,
        Some("n") | None => false,
        Some(other) => bail!("--replace-db must be y or n, got {other:?}"),
    };
    match (companies, replace) {
        (Some(_), true) => bail!("--companies and --replace-db=y cannot be combined"),
        (Some(raw), false) => Ok(ImportMode::Companies(parse_company_list(raw)?)),
        (None, true) => Ok(ImportMode::ReplaceAll),
        (None, false) => {
            bail!("refusing to replace the whole database without --replace-db=y")
        }
    }
}

fn read_input(file: Option<&str>) -> Result<String> {
    match file {
        None | Some("-") => {
            let mut input = String::new();
            io::stdin()
                .read_to_string(&mut input)
                .context("failed to read snapshot from stdin")?;
            Ok(input)
        }
        Some(path) => fs::read_to_string(path).with_context(|| format!("failed to read {path}")),
    }
}

fn print_report(report: &ValidationReport) {
    for error in &report.errors {
        eprintln!("error: {error}");
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
}

async fn import(args: &[String]) -> Result<()> {
    check_flags(args, &["file", "companies", "replace-db"])?;
    let mode = import_mode(flag(args, "companies"), flag(args, "replace-db"))?;

    let raw = read_input(flag(args, "file"))?;
    let value: Value = serde_json::from_str(&raw).context("snapshot is not valid JSON")?;
    let structural = structural_errors(&value);
    if !structural.is_empty() {
        for error in &structural {
            eprintln!("error: {error}");
        }
        bail!("snapshot is structurally incomplete");
    }
    let snapshot: Snapshot = serde_json::from_value(value).context("failed to parse snapshot")?;

    let db = open_database().await?;
    let result = import_snapshot(&db, snapshot, mode.clone()).await;
    db.close().await?;

    match result {
        Ok(report) => {
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
            tracing::info!(
                component = "maintenance",
                mode = ?mode,
                companies = report.companies,
                users = report.users,
                documents = report.documents,
                migrations = ?report.applied_migrations,
                "import finished"
            );
            Ok(())
        }
        Err(StoreError::Validation(report)) => {
            print_report(&report);
            bail!("import rejected: {} validation error(s)", report.errors.len())
        }
        Err(err) if err.is_transient() => Err(anyhow::Error::new(err)
            .context("import failed on a busy database; rerun once other writers finish")),
        Err(err) => Err(anyhow::Error::new(err).context("import failed")),
    }
}

fn validate_stdin() -> Result<bool> {
    let raw = read_input(None)?;
    let value: Value = serde_json::from_str(&raw).context("snapshot is not valid JSON")?;
    let report = validate_value(&value);
    print_report(&report);
    tracing::info!(
        component = "maintenance",
        valid = report.valid,
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "validation finished"
    );
    Ok(report.valid)
}

async fn migrate() -> Result<()> {
    let db = open_database().await?;
    let run = run_migrations(&db).await;
    db.close().await?;
    let run = match run {
        Err(err) if err.is_transient() => {
            return Err(anyhow::Error::new(err)
                .context("migration failed on a busy database; rerun once other writers finish"))
        }
        other => other.context("migration failed")?,
    };
    tracing::info!(
        component = "maintenance",
        from_data_version = run.from_data_version,
        from_schema_version = run.from_schema_version,
        applied = ?run.applied,
        recreated_schema = run.recreated_schema,
        "migration finished"
    );
    Ok(())
}

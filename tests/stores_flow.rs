mod common;

use anyhow::{ensure, Result};
use chrono::{Duration, Utc};
use docvault::models::{
    DocumentUpdate, FileType, NewAccessToken, NewCompany, NewDocument, NewUser, UserRole,
    UserUpdate,
};
use docvault::password::verify_password;
use docvault::stores::documents::{ListFilter, ANY_DEPTH};
use docvault::stores::{access_tokens, companies, documents, users};
use docvault::snapshot::{CompanyBundle, SnapshotDocument};
use docvault::template::{create_company_from_template, NewTenant};
use docvault::StoreError;
use serde_json::json;

use common::{acquire_db_lock, two_company_snapshot, TestDb};

fn new_user(email: &str, role: UserRole, home_folder: &str) -> NewUser {
    NewUser {
        email: email.to_string(),
        name: email.split('@').next().unwrap_or_default().to_string(),
        password_hash: None,
        phone: None,
        state: None,
        home_folder: home_folder.to_string(),
        role,
    }
}

fn new_doc(path: &str, file_type: FileType) -> NewDocument {
    NewDocument {
        name: path.rsplit('/').next().unwrap_or_default().to_string(),
        path: path.to_string(),
        file_type,
        content: json!({}),
        references: Vec::new(),
    }
}

fn new_company(name: &str, subdomain: &str) -> NewCompany {
    NewCompany {
        name: name.to_string(),
        display_name: String::new(),
        subdomain: subdomain.to_string(),
    }
}

#[tokio::test]
async fn users_flow() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let test_db = TestDb::sqlite().await?;

    let (acme, admin, viewer, other_admin) = test_db
        .with_conn(|conn| {
            let acme = companies::create(conn, &new_company("Acme", "Acme"))?;
            let globex = companies::create(conn, &new_company("Globex", "globex"))?;
            let admin = users::create(conn, acme.id, &new_user("Ada@Acme.test", UserRole::Admin, "ignored"))?;
            let viewer = users::create(conn, acme.id, &new_user("vic@acme.test", UserRole::Viewer, "sales/emea/"))?;
            let other_admin = users::create(conn, globex.id, &new_user("hank@globex.test", UserRole::Admin, ""))?;
            Ok((acme, admin, viewer, other_admin))
        })
        .await?;

    ensure!(acme.subdomain == "acme", "subdomain should be lowercased");
    ensure!(acme.display_name == "Acme", "display name should default to the name");
    ensure!(admin.id == 1 && viewer.id == 2, "ids should be sequential per company");
    ensure!(other_admin.id == 1, "second company should start at 1");
    ensure!(admin.email == "ada@acme.test", "email should be lowercased");
    ensure!(admin.home_folder.is_empty(), "admins have no home folder");
    ensure!(viewer.home_folder == "sales/emea", "home folder should be trimmed");
    ensure!(viewer.can_view_path("/org/sales/emea/q1"));
    ensure!(!viewer.can_view_path("/org/finance"));

    let company_id = acme.id;
    let rejected = test_db
        .with_conn(move |conn| {
            Ok(users::create(conn, company_id, &new_user("bad@acme.test", UserRole::Editor, "/abs")))
        })
        .await?;
    ensure!(matches!(rejected, Err(StoreError::Invalid(_))), "absolute home folder accepted");

    let last_admin_delete = test_db
        .with_conn(move |conn| Ok(users::delete(conn, company_id, 1)))
        .await?;
    ensure!(
        matches!(last_admin_delete, Err(StoreError::Invariant(_))),
        "last admin deleted: {last_admin_delete:?}"
    );

    let demote = test_db
        .with_conn(move |conn| {
            Ok(users::update(
                conn,
                company_id,
                1,
                &UserUpdate {
                    role: Some(UserRole::Viewer),
                    ..Default::default()
                },
            ))
        })
        .await?;
    ensure!(matches!(demote, Err(StoreError::Invariant(_))), "last admin demoted");

    let (promoted, demoted, deleted, admins) = test_db
        .with_conn(move |conn| {
            let promoted = users::update(
                conn,
                company_id,
                2,
                &UserUpdate {
                    role: Some(UserRole::Admin),
                    ..Default::default()
                },
            )?;
            let demoted = users::update(
                conn,
                company_id,
                1,
                &UserUpdate {
                    role: Some(UserRole::Editor),
                    home_folder: Some("ops".to_string()),
                    ..Default::default()
                },
            )?;
            let deleted = users::delete(conn, company_id, 1)?;
            let admins = users::count_admins(conn, company_id)?;
            Ok((promoted, demoted, deleted, admins))
        })
        .await?;

    ensure!(promoted.home_folder.is_empty(), "promotion should clear the home folder");
    ensure!(demoted.role == UserRole::Editor && demoted.home_folder == "ops");
    ensure!(deleted, "non-last admin should be deletable");
    ensure!(admins == 1, "expected one admin left, got {admins}");

    let next = test_db
        .with_conn(move |conn| users::create(conn, company_id, &new_user("new@acme.test", UserRole::Viewer, "")))
        .await?;
    ensure!(next.id == 3, "allocator should continue after the max id, got {}", next.id);

    Ok(())
}

#[tokio::test]
async fn documents_flow() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let test_db = TestDb::sqlite().await?;

    let company_id = test_db
        .with_conn(|conn| {
            let company = companies::create(conn, &new_company("Acme", "acme"))?;
            for (path, file_type) in [
                ("/org/connections/db1", FileType::Connection),
                ("/org/sales", FileType::Folder),
                ("/org/sales/revenue", FileType::Question),
                ("/org/sales/emea/q1", FileType::Question),
                ("/org/sales/emea/deep/q2", FileType::Question),
                ("/org/sales_archive/old", FileType::Question),
                ("/org/sales/overview", FileType::Dashboard),
            ] {
                documents::create(conn, company.id, &new_doc(path, file_type))?;
            }
            Ok(company.id)
        })
        .await?;

    let paths = |docs: Vec<docvault::models::Document>| -> Vec<String> {
        let mut paths: Vec<String> = docs.into_iter().map(|doc| doc.path).collect();
        paths.sort();
        paths
    };

    let (direct, two_levels, all, questions) = test_db
        .with_conn(move |conn| {
            let filter = |depth| ListFilter {
                path_prefix: Some("/org/sales".to_string()),
                depth: Some(depth),
                file_type: None,
            };
            let direct = documents::list(conn, company_id, &filter(1))?;
            let two_levels = documents::list(conn, company_id, &filter(2))?;
            let all = documents::list(conn, company_id, &filter(ANY_DEPTH))?;
            let questions = documents::list(
                conn,
                company_id,
                &ListFilter {
                    file_type: Some(FileType::Question),
                    ..filter(ANY_DEPTH)
                },
            )?;
            Ok((direct, two_levels, all, questions))
        })
        .await?;

    ensure!(
        paths(direct) == vec!["/org/sales/overview", "/org/sales/revenue"],
        "depth 1 should list direct children only"
    );
    ensure!(paths(two_levels).len() == 3, "depth 2 should add emea/q1");
    let all = paths(all);
    ensure!(all.len() == 4, "unlimited depth: {all:?}");
    ensure!(
        !all.iter().any(|path| path.starts_with("/org/sales_archive")),
        "prefix must match whole segments"
    );
    ensure!(questions.len() == 3, "type filter should keep questions");

    let invalid = test_db
        .with_conn(move |conn| Ok(documents::create(conn, company_id, &new_doc("org/relative", FileType::Question))))
        .await?;
    ensure!(matches!(invalid, Err(StoreError::Invalid(_))), "relative path accepted");

    // bulk update equals sequential updates
    let updates = vec![
        (
            3,
            DocumentUpdate {
                name: Some("rev".to_string()),
                content: Some(json!({"query": "select 2"})),
                ..Default::default()
            },
        ),
        (
            4,
            DocumentUpdate {
                path: Some("/org/sales/emea/q1-renamed".to_string()),
                ..Default::default()
            },
        ),
        (
            3,
            DocumentUpdate {
                references: Some(vec![4]),
                content: Some(json!({"query": "select 3"})),
                ..Default::default()
            },
        ),
    ];
    let sequential_updates = updates.clone();

    let other = TestDb::sqlite().await?;
    let other_company = other
        .with_conn(|conn| {
            let company = companies::create(conn, &new_company("Acme", "acme"))?;
            for (path, file_type) in [
                ("/org/connections/db1", FileType::Connection),
                ("/org/sales", FileType::Folder),
                ("/org/sales/revenue", FileType::Question),
                ("/org/sales/emea/q1", FileType::Question),
            ] {
                documents::create(conn, company.id, &new_doc(path, file_type))?;
            }
            Ok(company.id)
        })
        .await?;

    let bulk = test_db
        .with_conn(move |conn| documents::bulk_update(conn, company_id, updates))
        .await?;
    let sequential = other
        .with_conn(move |conn| {
            for (id, update) in &sequential_updates {
                documents::update(conn, other_company, *id, update)?;
            }
            documents::get_by_ids(conn, other_company, &[3, 4])
        })
        .await?;

    ensure!(bulk.len() == 2, "bulk update should return each id once");
    for (left, right) in bulk.iter().zip(sequential.iter()) {
        ensure!(left.id == right.id);
        ensure!(left.name == right.name, "name differs for {}", left.id);
        ensure!(left.path == right.path, "path differs for {}", left.id);
        ensure!(left.content == right.content, "content differs for {}", left.id);
        ensure!(left.references == right.references, "references differ for {}", left.id);
    }
    ensure!(bulk[0].content == json!({"query": "select 3"}), "later update should win");

    let missing = test_db
        .with_conn(move |conn| {
            Ok(documents::bulk_update(
                conn,
                company_id,
                vec![
                    (3, DocumentUpdate { name: Some("x".into()), ..Default::default() }),
                    (999, DocumentUpdate { name: Some("y".into()), ..Default::default() }),
                ],
            ))
        })
        .await?;
    ensure!(matches!(missing, Err(StoreError::NotFound(_))), "missing id accepted");
    let unchanged = test_db
        .with_conn(move |conn| documents::get_by_id(conn, company_id, 3))
        .await?;
    ensure!(
        unchanged.map(|doc| doc.name) == Some("rev".to_string()),
        "failed bulk update must roll back"
    );

    let last_connection = test_db
        .with_conn(move |conn| Ok(documents::delete(conn, company_id, 1)))
        .await?;
    ensure!(
        matches!(last_connection, Err(StoreError::Invariant(_))),
        "last connection deleted"
    );

    let (second, deleted_first) = test_db
        .with_conn(move |conn| {
            let second = documents::create(conn, company_id, &new_doc("/org/connections/db2", FileType::Connection))?;
            let deleted = documents::delete(conn, company_id, 1)?;
            Ok((second, deleted))
        })
        .await?;
    ensure!(second.id == 8, "next id should follow the max, got {}", second.id);
    ensure!(deleted_first, "connection with a sibling should be deletable");

    Ok(())
}

#[tokio::test]
async fn access_tokens_flow() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let test_db = TestDb::sqlite().await?;

    let (company_id, token) = test_db
        .with_conn(|conn| {
            let company = companies::create(conn, &new_company("Acme", "acme"))?;
            users::create(conn, company.id, &new_user("ada@acme.test", UserRole::Admin, ""))?;
            users::create(conn, company.id, &new_user("vic@acme.test", UserRole::Viewer, "sales"))?;
            documents::create(conn, company.id, &new_doc("/org/connections/db1", FileType::Connection))?;
            let dashboard = documents::create(conn, company.id, &new_doc("/org/sales/overview", FileType::Dashboard))?;
            let token = access_tokens::create(
                conn,
                &NewAccessToken {
                    company_id: company.id,
                    file_id: dashboard.id,
                    view_as_user_id: 2,
                    created_by_user_id: 1,
                    ttl: None,
                },
            )?;
            Ok((company.id, token))
        })
        .await?;

    ensure!(token.token.len() >= 43, "token should carry 32 random bytes");
    ensure!(token.is_active);
    ensure!(
        token.expires_at - token.created_at == Duration::days(access_tokens::DEFAULT_TTL_DAYS),
        "default lifetime should be applied"
    );

    let value = token.token.clone();
    let (now_resolved, later_resolved, unknown) = test_db
        .with_conn(move |conn| {
            let now = Utc::now().naive_utc();
            let now_resolved = access_tokens::resolve(conn, &value, now)?;
            let later_resolved = access_tokens::resolve(conn, &value, now + Duration::days(31))?;
            let unknown = access_tokens::resolve(conn, "no-such-token", now)?;
            Ok((now_resolved, later_resolved, unknown))
        })
        .await?;
    let (_, viewer) = now_resolved.ok_or_else(|| anyhow::anyhow!("token should resolve"))?;
    ensure!(viewer.id == 2 && viewer.role == UserRole::Viewer, "should act as the viewer");
    ensure!(later_resolved.is_none(), "expired token resolved");
    ensure!(unknown.is_none(), "unknown token resolved");

    let value = token.token.clone();
    let after_revoke = test_db
        .with_conn(move |conn| {
            ensure_revoked(access_tokens::revoke(conn, &value)?)?;
            access_tokens::resolve(conn, &value, Utc::now().naive_utc())
        })
        .await?;
    ensure!(after_revoke.is_none(), "revoked token resolved");

    let bad_ttl = test_db
        .with_conn(move |conn| {
            Ok(access_tokens::create(
                conn,
                &NewAccessToken {
                    company_id,
                    file_id: 2,
                    view_as_user_id: 2,
                    created_by_user_id: 1,
                    ttl: Some(Duration::zero()),
                },
            ))
        })
        .await?;
    ensure!(matches!(bad_ttl, Err(StoreError::Invalid(_))), "zero lifetime accepted");

    let remaining = test_db
        .with_conn(move |conn| {
            documents::delete(conn, company_id, 2)?;
            access_tokens::list_for_file(conn, company_id, 2)
        })
        .await?;
    ensure!(remaining.is_empty(), "tokens should go with their document");

    Ok(())
}

fn ensure_revoked(revoked: bool) -> docvault::StoreResult<()> {
    if revoked {
        Ok(())
    } else {
        Err(StoreError::not_found("token"))
    }
}

#[tokio::test]
async fn template_flow() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let test_db = TestDb::sqlite().await?;

    let template = two_company_snapshot()
        .company(1)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("template company missing"))?;

    let created = test_db
        .with_conn(move |conn| {
            create_company_from_template(
                conn,
                &template,
                &NewTenant {
                    name: "Initech".to_string(),
                    display_name: "Initech LLC".to_string(),
                    subdomain: "initech".to_string(),
                    admin_email: "bill@initech.test".to_string(),
                    admin_name: "Bill".to_string(),
                    admin_password: "tps-reports".to_string(),
                },
            )
        })
        .await?;

    ensure!(created.documents == 3, "all template documents should be copied");
    ensure!(created.admin.is_admin() && created.admin.id == 1);
    let hash = created
        .admin
        .password_hash
        .clone()
        .ok_or_else(|| anyhow::anyhow!("admin should have a password"))?;
    ensure!(verify_password("tps-reports", &hash)?, "password should verify");

    let company_id = created.company.id;
    let (dashboard, users) = test_db
        .with_conn(move |conn| {
            Ok((
                documents::get_by_id(conn, company_id, 3)?,
                users::list(conn, company_id)?,
            ))
        })
        .await?;
    let dashboard = dashboard.ok_or_else(|| anyhow::anyhow!("dashboard should keep its id"))?;
    ensure!(dashboard.references == vec![2], "references should survive the copy");
    ensure!(users.len() == 1, "template users must not be copied");

    let empty = two_company_snapshot()
        .company(2)
        .cloned()
        .map(|mut bundle| {
            bundle.documents.retain(|doc| doc.file_type != FileType::Connection);
            bundle
        })
        .ok_or_else(|| anyhow::anyhow!("second company missing"))?;
    let refused = test_db
        .with_conn(move |conn| {
            Ok(create_company_from_template(
                conn,
                &empty,
                &NewTenant {
                    name: "Hooli".to_string(),
                    display_name: String::new(),
                    subdomain: "hooli".to_string(),
                    admin_email: "gavin@hooli.test".to_string(),
                    admin_name: "Gavin".to_string(),
                    admin_password: "secret".to_string(),
                },
            ))
        })
        .await?;
    ensure!(matches!(refused, Err(StoreError::Invalid(_))), "template without a connection accepted");

    Ok(())
}

#[tokio::test]
async fn closed_handle_refuses_work_until_reopened() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let test_db = TestDb::sqlite().await?;

    test_db.db.initialize_schema().await?;
    test_db.db.close().await?;
    let refused = test_db.db.run(|conn| companies::count(conn)).await;
    ensure!(matches!(refused, Err(StoreError::Closed)), "closed handle ran a query");

    test_db.db.reset_and_reopen().await?;
    let count = test_db.with_conn(|conn| companies::count(conn)).await?;
    ensure!(count == 0, "reopened database should be empty");

    Ok(())
}

#[tokio::test]
async fn snapshot_inserts_apply_store_rules() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let test_db = TestDb::sqlite().await?;

    let bundle: CompanyBundle = serde_json::from_value(json!({
        "id": 7, "name": "Acme", "subdomain": " ACME ", "users": [], "documents": []
    }))?;
    let stored = test_db
        .with_conn(move |conn| {
            companies::insert_with_id(conn, &bundle)?;
            companies::get_by_id(conn, 7)
        })
        .await?;
    let subdomain = stored.map(|company| company.subdomain);
    ensure!(subdomain.as_deref() == Some("acme"), "subdomain stored as {subdomain:?}");

    let bad_subdomain: CompanyBundle = serde_json::from_value(json!({
        "id": 8, "name": "Bad", "subdomain": "no_underscores", "users": [], "documents": []
    }))?;
    let refused = test_db
        .db.run(move |conn| companies::insert_with_id(conn, &bad_subdomain))
        .await;
    ensure!(matches!(refused, Err(StoreError::Invalid(_))), "malformed subdomain stored");

    for path in ["org/relative", "/org/trailing/", "/org/../escape", "/org//double"] {
        let document: SnapshotDocument = serde_json::from_value(json!({
            "id": 1, "type": "question", "path": path
        }))?;
        let refused = test_db
            .db.run(move |conn| documents::insert_with_id(conn, 7, &document))
            .await;
        ensure!(matches!(refused, Err(StoreError::Invalid(_))), "{path} stored");
    }
    let stored = test_db
        .with_conn(|conn| documents::list_all(conn, Some(7)))
        .await?;
    ensure!(stored.is_empty(), "rejected documents left rows behind");

    Ok(())
}

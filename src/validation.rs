//! Integrity checks over a whole snapshot.
//!
//! Errors block an import, warnings are reported and let it proceed. Every
//! check runs; nothing stops at the first problem.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::content::{AssetRef, FileContent};
use crate::migrations::{
    HOME_FOLDERS_NORMALIZED_VERSION, ORG_ROOTED_VERSION, SUBDOMAIN_REQUIRED_VERSION,
};
use crate::models::{FileType, UserRole};
use crate::snapshot::{CompanyBundle, Snapshot};
use crate::stores::companies::normalize_subdomain;
use crate::stores::documents::check_path;
use crate::stores::users::normalize_home_folder;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, message: String) {
        self.errors.push(message);
    }

    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }

    /// Errors once `version` has reached `enforced_from`; before that a
    /// migration still repairs the value, so it is only a warning.
    fn from_version(&mut self, version: i64, enforced_from: i64, message: String) {
        if version >= enforced_from {
            self.error(message);
        } else {
            self.warn(message);
        }
    }

    fn finish(mut self) -> Self {
        self.valid = self.errors.is_empty();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Error,
    Warning,
}

/// Missing top-level or per-company arrays. These make a document
/// unusable as a snapshot before any other check can run.
pub fn structural_errors(value: &Value) -> Vec<String> {
    let Some(root) = value.as_object() else {
        return vec!["snapshot must be a JSON object".to_string()];
    };
    let Some(companies) = root.get("companies").and_then(Value::as_array) else {
        return vec!["snapshot is missing the companies array".to_string()];
    };

    let mut errors = Vec::new();
    for (index, company) in companies.iter().enumerate() {
        let label = company
            .get("id")
            .and_then(Value::as_i64)
            .map(|id| format!("company {id}"))
            .unwrap_or_else(|| format!("company at index {index}"));
        for field in ["users", "documents"] {
            if company.get(field).and_then(Value::as_array).is_none() {
                errors.push(format!("{label} is missing the {field} array"));
            }
        }
    }
    errors
}

/// Checks a snapshot that has not been parsed yet. Structural problems are
/// reported on their own; the typed checks need a well-formed document.
pub fn validate_value(value: &Value) -> ValidationReport {
    let mut report = ValidationReport {
        errors: structural_errors(value),
        ..Default::default()
    };
    if !report.errors.is_empty() {
        return report.finish();
    }

    match serde_json::from_value::<Snapshot>(value.clone()) {
        Ok(snapshot) => validate(&snapshot),
        Err(err) => {
            report.error(format!("snapshot does not match the expected shape: {err}"));
            report.finish()
        }
    }
}

pub fn validate(snapshot: &Snapshot) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut company_ids = HashSet::new();
    let mut company_names = HashSet::new();
    let mut subdomains = HashSet::new();
    let mut tokens = HashSet::new();
    for bundle in &snapshot.companies {
        if !company_ids.insert(bundle.id) {
            report.error(format!("duplicate company id {}", bundle.id));
        }
        if !company_names.insert(bundle.name.as_str()) {
            report.error(format!("duplicate company name {:?}", bundle.name));
        }
        match bundle.subdomain.as_deref().map(str::trim) {
            Some(subdomain) if !subdomain.is_empty() => {
                if let Err(err) = normalize_subdomain(subdomain) {
                    report.error(format!("company {}: {err}", bundle.id));
                }
                if !subdomains.insert(subdomain.to_ascii_lowercase()) {
                    report.error(format!("duplicate company subdomain {subdomain:?}"));
                }
            }
            _ if snapshot.version >= SUBDOMAIN_REQUIRED_VERSION => {
                report.error(format!("company {} has no subdomain", bundle.id));
            }
            _ => report.warn(format!(
                "company {} has no subdomain; one is assigned on migration",
                bundle.id
            )),
        }

        for token in &bundle.access_tokens {
            if !tokens.insert(token.token.as_str()) {
                report.error(format!(
                    "company {}: access token {:?} is used more than once",
                    bundle.id, token.token
                ));
            }
        }

        check_company(snapshot.version, bundle, &mut report);
    }

    report.finish()
}

fn check_company(version: i64, bundle: &CompanyBundle, report: &mut ValidationReport) {
    let company = bundle.id;

    let mut user_ids = HashSet::new();
    let mut emails = HashSet::new();
    for user in &bundle.users {
        if !user_ids.insert(user.id) {
            report.error(format!("company {company}: duplicate user id {}", user.id));
        }
        // Blank emails share one stored value, so they collide too.
        let email = user.email.trim().to_ascii_lowercase();
        if !emails.insert(email) {
            report.error(format!(
                "company {company}: duplicate user email {:?}",
                user.email
            ));
        }
        if let Err(err) = normalize_home_folder(user.role, &user.home_folder) {
            report.from_version(
                version,
                HOME_FOLDERS_NORMALIZED_VERSION,
                format!("company {company}: user {}: {err}", user.id),
            );
        }
        if let Some(owner) = user.company_id.filter(|owner| *owner != company) {
            report.error(format!(
                "company {company}: user {} belongs to company {owner}",
                user.id
            ));
        }
    }

    let mut types: HashMap<i64, FileType> = HashMap::new();
    let mut paths = HashSet::new();
    for document in &bundle.documents {
        if types.insert(document.id, document.file_type).is_some() {
            report.error(format!(
                "company {company}: duplicate document id {}",
                document.id
            ));
        }
        if let Err(err) = check_path(&document.path) {
            report.from_version(
                version,
                ORG_ROOTED_VERSION,
                format!("company {company}: document {}: {err}", document.id),
            );
        }
        if !paths.insert(document.path.as_str()) {
            report.error(format!(
                "company {company}: duplicate document path {:?}",
                document.path
            ));
        }
        if let Some(owner) = document.company_id.filter(|owner| *owner != company) {
            report.error(format!(
                "company {company}: document {} belongs to company {owner}",
                document.id
            ));
        }
    }

    for document in &bundle.documents {
        if !document.content.is_object() {
            report.error(format!(
                "company {company}: document {} content must be a JSON object",
                document.id
            ));
            continue;
        }

        let severity = match document.file_type {
            FileType::Dashboard => Severity::Error,
            FileType::Notebook | FileType::Presentation => Severity::Warning,
            _ => {
                check_references(company, document.id, &document.references, &types, report);
                continue;
            }
        };
        let content = FileContent::decode(document.file_type, &document.content);
        for asset in content.assets() {
            let problem = match asset {
                AssetRef::Question { id } => match types.get(id) {
                    None => Some(format!("references missing question {id}")),
                    Some(FileType::Question) => None,
                    Some(other) => Some(format!("references document {id} of type {other} as a question")),
                },
                AssetRef::Malformed(raw) => Some(format!("has a question asset without an id: {raw}")),
                AssetRef::Inline { .. } => None,
            };
            if let Some(problem) = problem {
                let message = format!(
                    "company {company}: {} {} {problem}",
                    document.file_type, document.id
                );
                match severity {
                    Severity::Error => report.error(message),
                    Severity::Warning => report.warn(message),
                }
            }
        }
        check_references(company, document.id, &document.references, &types, report);
    }

    for token in &bundle.access_tokens {
        if token.company_id != company {
            report.error(format!(
                "company {company}: access token for document {} belongs to company {}",
                token.file_id, token.company_id
            ));
        }
        if !types.contains_key(&token.file_id) {
            report.warn(format!(
                "company {company}: access token points at missing document {}",
                token.file_id
            ));
        }
        if !user_ids.contains(&token.view_as_user_id) {
            report.warn(format!(
                "company {company}: access token views as missing user {}",
                token.view_as_user_id
            ));
        }
    }

    if !bundle.users.iter().any(|user| user.role == UserRole::Admin) {
        report.error(format!(
            "company {company} ({}) has no admin user",
            bundle.name
        ));
    }
    if !bundle
        .documents
        .iter()
        .any(|document| document.file_type == FileType::Connection)
    {
        report.error(format!(
            "company {company} ({}) has no connection document",
            bundle.name
        ));
    }
}

fn check_references(
    company: i64,
    document: i64,
    references: &[i64],
    types: &HashMap<i64, FileType>,
    report: &mut ValidationReport,
) {
    for reference in references {
        if !types.contains_key(reference) {
            report.warn(format!(
                "company {company}: document {document} lists missing reference {reference}"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn base() -> Value {
        json!({
            "version": 6,
            "companies": [{
                "id": 1,
                "name": "Acme",
                "subdomain": "acme",
                "users": [{"id": 1, "role": "admin", "home_folder": ""}],
                "documents": [
                    {"id": 1, "type": "connection", "path": "/org/connections/db1"},
                    {"id": 2, "type": "question", "path": "/org/q", "content": {}}
                ]
            }]
        })
    }

    fn with_document(document: Value) -> Value {
        let mut value = base();
        value["companies"][0]["documents"]
            .as_array_mut()
            .unwrap()
            .push(document);
        value
    }

    #[test]
    fn minimal_snapshot_is_valid() {
        let report = validate_value(&base());
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn missing_arrays_are_all_reported() {
        let report = validate_value(&json!({"version": 6, "companies": [{"id": 1}, {"id": 2, "users": []}]}));
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 3);
        assert!(validate_value(&json!({"version": 6})).errors[0].contains("companies"));
    }

    #[test]
    fn dashboard_with_missing_question_is_an_error() {
        let report = validate_value(&with_document(json!({
            "id": 9, "type": "dashboard", "path": "/org/d",
            "content": {"assets": [{"type": "question", "id": 404}]}
        })));
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("404"));
    }

    #[test]
    fn notebook_with_missing_question_is_a_warning() {
        let report = validate_value(&with_document(json!({
            "id": 9, "type": "notebook", "path": "/org/n",
            "content": {"assets": [{"type": "question", "id": 404}]}
        })));
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("404"));
    }

    #[test]
    fn dashboard_referencing_a_non_question_is_an_error() {
        let report = validate_value(&with_document(json!({
            "id": 9, "type": "dashboard", "path": "/org/d",
            "content": {"assets": [{"type": "question", "id": 1}]}
        })));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("of type connection"));
    }

    #[test]
    fn presentation_problems_are_warnings() {
        let report = validate_value(&with_document(json!({
            "id": 9, "type": "presentation", "path": "/org/p",
            "content": {"slides": [{"assets": [{"type": "question", "id": 77}]}]}
        })));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn missing_admin_is_a_single_error() {
        let mut value = base();
        value["companies"][0]["users"][0]["role"] = json!("viewer");
        let report = validate_value(&value);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("company 1"));
        assert!(report.errors[0].contains("admin"));
    }

    #[test]
    fn unrelated_problems_are_all_collected() {
        let mut value = with_document(json!({"id": 2, "type": "question", "path": "/org/q"}));
        value["companies"][0]["users"][0]["role"] = json!("editor");
        value["companies"][0]["documents"][0]["type"] = json!("question");
        value["companies"][0]["users"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": 1, "email": "vic@acme.test", "role": "viewer", "company_id": 2}));
        let report = validate_value(&value);
        // duplicate user id, foreign user, duplicate doc id, duplicate path,
        // no admin, no connection
        assert_eq!(report.errors.len(), 6, "{:#?}", report.errors);
    }

    #[test]
    fn null_content_is_rejected() {
        let report = validate_value(&with_document(json!({
            "id": 9, "type": "question", "path": "/org/null", "content": null
        })));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("document 9"));
    }

    #[test]
    fn subdomain_is_required_from_version_six() {
        let mut value = base();
        value["companies"][0]
            .as_object_mut()
            .unwrap()
            .remove("subdomain");
        assert!(!validate_value(&value).valid);

        value["version"] = json!(5);
        let report = validate_value(&value);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn blank_emails_collide_like_stored_ones() {
        let mut value = base();
        value["companies"][0]["users"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": 2, "role": "viewer", "email": "  "}));
        let report = validate_value(&value);
        assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
        assert!(report.errors[0].contains("duplicate user email"));
    }

    #[test]
    fn escaping_home_folders_fail_once_normalized() {
        let mut value = base();
        value["companies"][0]["users"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": 2, "email": "vic@acme.test", "role": "viewer", "home_folder": "../finance"}));
        let report = validate_value(&value);
        assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
        assert!(report.errors[0].contains("user 2"));

        value["version"] = json!(1);
        value["companies"][0]["documents"][0]["path"] = json!("/connections/db1");
        value["companies"][0]["documents"][1]["path"] = json!("/q");
        let report = validate_value(&value);
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.warnings.iter().any(|warning| warning.contains("user 2")));
    }

    #[test]
    fn malformed_paths_are_errors() {
        let report = validate_value(&with_document(json!({
            "id": 9, "type": "question", "path": "/org/../etc"
        })));
        assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
        assert!(report.errors[0].contains("document 9"));

        let report = validate_value(&with_document(json!({
            "id": 9, "type": "question", "path": "org/relative"
        })));
        assert!(!report.valid);
    }

    #[test]
    fn malformed_subdomains_are_errors() {
        let mut value = base();
        value["companies"][0]["subdomain"] = json!("acme_corp");
        let report = validate_value(&value);
        assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
        assert!(report.errors[0].contains("company 1"));
    }

    #[test]
    fn tokens_are_unique_across_companies() {
        let token = |company: i64| {
            json!({
                "token": "shared", "company_id": company, "file_id": 1,
                "view_as_user_id": 1, "created_by_user_id": 1,
                "created_at": "2024-03-01T09:30:00", "expires_at": "2099-01-01T00:00:00", "is_active": true
            })
        };
        let mut value = base();
        let mut second = value["companies"][0].clone();
        second["id"] = json!(2);
        second["name"] = json!("Globex");
        second["subdomain"] = json!("globex");
        second["access_tokens"] = json!([token(2)]);
        value["companies"][0]["access_tokens"] = json!([token(1)]);
        value["companies"].as_array_mut().unwrap().push(second);

        let report = validate_value(&value);
        assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
        assert!(report.errors[0].contains("\"shared\""));
    }

    #[test]
    fn dangling_references_are_warnings() {
        let report = validate_value(&with_document(json!({
            "id": 9, "type": "report", "path": "/org/r", "references": [2, 55]
        })));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("55"));
    }
}

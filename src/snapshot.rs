//! The export/import unit: a data version plus one bundle per company.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreResult;
use crate::models::{AccessToken, Company, Document, FileType, User, UserRole};
use crate::schema::INITIAL_VERSION;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "initial_version")]
    pub version: i64,
    pub companies: Vec<CompanyBundle>,
}

fn initial_version() -> i64 {
    INITIAL_VERSION
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyBundle {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<NaiveDateTime>,
    pub users: Vec<SnapshotUser>,
    pub documents: Vec<SnapshotDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_tokens: Vec<AccessToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotUser {
    pub id: i64,
    /// Inherited from the enclosing bundle when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<i64>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub home_folder: String,
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<i64>,
    #[serde(default)]
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(default = "empty_object")]
    pub content: Value,
    #[serde(default)]
    pub references: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<NaiveDateTime>,
}

impl Snapshot {
    pub fn empty(version: i64) -> Self {
        Self {
            version,
            companies: Vec::new(),
        }
    }

    pub fn from_json(json: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> StoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn company(&self, id: i64) -> Option<&CompanyBundle> {
        self.companies.iter().find(|bundle| bundle.id == id)
    }

    pub fn company_ids(&self) -> Vec<i64> {
        self.companies.iter().map(|bundle| bundle.id).collect()
    }

    /// Keeps only the bundles whose id is in `ids`.
    pub fn retain_companies(&mut self, ids: &[i64]) {
        self.companies.retain(|bundle| ids.contains(&bundle.id));
    }

    pub fn sort(&mut self) {
        self.companies.sort_by_key(|bundle| bundle.id);
        for bundle in &mut self.companies {
            bundle.users.sort_by_key(|user| user.id);
            bundle.documents.sort_by_key(|document| document.id);
            bundle
                .access_tokens
                .sort_by(|a, b| (a.created_at, &a.token).cmp(&(b.created_at, &b.token)));
        }
    }
}

impl CompanyBundle {
    pub fn from_company(company: Company) -> Self {
        Self {
            id: company.id,
            name: company.name,
            display_name: company.display_name,
            subdomain: Some(company.subdomain).filter(|subdomain| !subdomain.is_empty()),
            created_at: Some(company.created_at),
            updated_at: Some(company.updated_at),
            users: Vec::new(),
            documents: Vec::new(),
            access_tokens: Vec::new(),
        }
    }

    pub fn document(&self, id: i64) -> Option<&SnapshotDocument> {
        self.documents.iter().find(|document| document.id == id)
    }

    pub fn user(&self, id: i64) -> Option<&SnapshotUser> {
        self.users.iter().find(|user| user.id == id)
    }
}

impl From<User> for SnapshotUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            company_id: Some(user.company_id),
            email: user.email,
            name: user.name,
            password_hash: user.password_hash,
            phone: user.phone,
            state: user.state,
            home_folder: user.home_folder,
            role: user.role,
            created_at: Some(user.created_at),
            updated_at: Some(user.updated_at),
        }
    }
}

impl From<Document> for SnapshotDocument {
    fn from(document: Document) -> Self {
        Self {
            id: document.id,
            company_id: Some(document.company_id),
            name: document.name,
            path: document.path,
            file_type: document.file_type,
            content: document.content,
            references: document.references,
            created_at: Some(document.created_at),
            updated_at: Some(document.updated_at),
        }
    }
}

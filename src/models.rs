use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Nullable, Text, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Root of the visible file tree inside every company.
pub const ORG_ROOT: &str = "/org";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Editor,
    Viewer,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "admin" => Ok(Self::Admin),
            "editor" => Ok(Self::Editor),
            "viewer" => Ok(Self::Viewer),
            other => Err(StoreError::invalid(format!("unknown role {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Question,
    Folder,
    Dashboard,
    Notebook,
    Presentation,
    Report,
    Alert,
    Connection,
    Context,
    Config,
}

impl FileType {
    pub const ALL: [FileType; 10] = [
        Self::Question,
        Self::Folder,
        Self::Dashboard,
        Self::Notebook,
        Self::Presentation,
        Self::Report,
        Self::Alert,
        Self::Connection,
        Self::Context,
        Self::Config,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Folder => "folder",
            Self::Dashboard => "dashboard",
            Self::Notebook => "notebook",
            Self::Presentation => "presentation",
            Self::Report => "report",
            Self::Alert => "alert",
            Self::Connection => "connection",
            Self::Context => "context",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|file_type| file_type.as_str() == value)
            .ok_or_else(|| StoreError::invalid(format!("unknown file type {value:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, QueryableByName)]
pub struct Company {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Text)]
    pub display_name: String,
    #[diesel(sql_type = Text)]
    pub subdomain: String,
    #[diesel(sql_type = Timestamp)]
    pub created_at: NaiveDateTime,
    #[diesel(sql_type = Timestamp)]
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewCompany {
    pub name: String,
    pub display_name: String,
    pub subdomain: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompanyUpdate {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub subdomain: Option<String>,
}

#[derive(Debug, QueryableByName)]
pub struct UserRow {
    #[diesel(sql_type = BigInt)]
    pub company_id: i64,
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Text)]
    pub email: String,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub password_hash: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub phone: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub state: Option<String>,
    #[diesel(sql_type = Text)]
    pub home_folder: String,
    #[diesel(sql_type = Text)]
    pub role: String,
    #[diesel(sql_type = Timestamp)]
    pub created_at: NaiveDateTime,
    #[diesel(sql_type = Timestamp)]
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub company_id: i64,
    pub id: i64,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub phone: Option<String>,
    pub state: Option<String>,
    pub home_folder: String,
    pub role: UserRole,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Absolute path of the subtree this user may see.
    pub fn visible_root(&self) -> String {
        if self.is_admin() || self.home_folder.is_empty() {
            ORG_ROOT.to_string()
        } else {
            format!("{ORG_ROOT}/{}", self.home_folder)
        }
    }

    pub fn can_view_path(&self, path: &str) -> bool {
        let root = self.visible_root();
        path == root || path.starts_with(&format!("{root}/"))
    }
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            company_id: row.company_id,
            id: row.id,
            email: row.email,
            name: row.name,
            password_hash: row.password_hash,
            phone: row.phone,
            state: row.state,
            home_folder: row.home_folder,
            role: row.role.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub password_hash: Option<String>,
    pub phone: Option<String>,
    pub state: Option<String>,
    pub home_folder: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub name: Option<String>,
    pub password_hash: Option<Option<String>>,
    pub phone: Option<Option<String>>,
    pub state: Option<Option<String>>,
    pub home_folder: Option<String>,
    pub role: Option<UserRole>,
}

#[derive(Debug, QueryableByName)]
pub struct FileRow {
    #[diesel(sql_type = BigInt)]
    pub company_id: i64,
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Text)]
    pub name: String,
    #[diesel(sql_type = Text)]
    pub path: String,
    #[diesel(sql_type = Text)]
    pub file_type: String,
    #[diesel(sql_type = Text)]
    pub content: String,
    #[diesel(sql_type = Text)]
    pub file_references: String,
    #[diesel(sql_type = Timestamp)]
    pub created_at: NaiveDateTime,
    #[diesel(sql_type = Timestamp)]
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub company_id: i64,
    pub id: i64,
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub content: Value,
    pub references: Vec<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TryFrom<FileRow> for Document {
    type Error = StoreError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(Self {
            company_id: row.company_id,
            id: row.id,
            name: row.name,
            path: row.path,
            file_type: row.file_type.parse()?,
            content: serde_json::from_str(&row.content)?,
            references: serde_json::from_str(&row.file_references)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub name: String,
    pub path: String,
    pub file_type: FileType,
    pub content: Value,
    pub references: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub name: Option<String>,
    pub path: Option<String>,
    pub content: Option<Value>,
    pub references: Option<Vec<i64>>,
}

impl DocumentUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.path.is_none()
            && self.content.is_none()
            && self.references.is_none()
    }

    /// Folds `later` over `self` field by field, as if both were applied in
    /// sequence.
    pub fn merge(&mut self, later: DocumentUpdate) {
        if later.name.is_some() {
            self.name = later.name;
        }
        if later.path.is_some() {
            self.path = later.path;
        }
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.references.is_some() {
            self.references = later.references;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, QueryableByName)]
pub struct AccessToken {
    #[diesel(sql_type = Text)]
    pub token: String,
    #[diesel(sql_type = BigInt)]
    pub company_id: i64,
    #[diesel(sql_type = BigInt)]
    pub file_id: i64,
    #[diesel(sql_type = BigInt)]
    pub view_as_user_id: i64,
    #[diesel(sql_type = BigInt)]
    pub created_by_user_id: i64,
    #[diesel(sql_type = Timestamp)]
    pub created_at: NaiveDateTime,
    #[diesel(sql_type = Timestamp)]
    pub expires_at: NaiveDateTime,
    #[diesel(sql_type = Bool)]
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewAccessToken {
    pub company_id: i64,
    pub file_id: i64,
    pub view_as_user_id: i64,
    pub created_by_user_id: i64,
    pub ttl: Option<chrono::Duration>,
}

#[derive(Debug, Clone, QueryableByName)]
pub struct Setting {
    #[diesel(sql_type = Text)]
    pub key: String,
    #[diesel(sql_type = Text)]
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: UserRole, home_folder: &str) -> User {
        let now = chrono::Utc::now().naive_utc();
        User {
            company_id: 1,
            id: 1,
            email: "a@example.com".into(),
            name: "A".into(),
            password_hash: None,
            phone: None,
            state: None,
            home_folder: home_folder.into(),
            role,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn file_types_round_trip_through_strings() {
        for file_type in FileType::ALL {
            assert_eq!(file_type.as_str().parse::<FileType>().unwrap(), file_type);
        }
        assert!("spreadsheet".parse::<FileType>().is_err());
    }

    #[test]
    fn viewers_only_see_their_home_folder() {
        let viewer = user(UserRole::Viewer, "sales/emea");
        assert!(viewer.can_view_path("/org/sales/emea"));
        assert!(viewer.can_view_path("/org/sales/emea/q1"));
        assert!(!viewer.can_view_path("/org/sales/emea-archive"));
        assert!(!viewer.can_view_path("/org/finance"));

        let admin = user(UserRole::Admin, "");
        assert!(admin.can_view_path("/org/finance"));
    }

    #[test]
    fn later_updates_win_field_by_field() {
        let mut first = DocumentUpdate {
            name: Some("a".into()),
            path: Some("/org/a".into()),
            ..Default::default()
        };
        first.merge(DocumentUpdate {
            name: Some("b".into()),
            ..Default::default()
        });
        assert_eq!(first.name.as_deref(), Some("b"));
        assert_eq!(first.path.as_deref(), Some("/org/a"));
    }
}

//! New companies seeded from a template bundle.
//!
//! The template's documents are copied with their ids, so references between
//! them stay valid in the new company. Its users are not copied; the new
//! company gets a single admin instead.

use tracing::info;

use crate::adapter::Conn;
use crate::error::{StoreError, StoreResult};
use crate::models::{Company, FileType, NewCompany, NewUser, User, UserRole};
use crate::password::hash_password;
use crate::snapshot::CompanyBundle;
use crate::stores::{companies, documents, users};

#[derive(Debug, Clone)]
pub struct NewTenant {
    pub name: String,
    pub display_name: String,
    pub subdomain: String,
    pub admin_email: String,
    pub admin_name: String,
    pub admin_password: String,
}

#[derive(Debug, Clone)]
pub struct CreatedTenant {
    pub company: Company,
    pub admin: User,
    pub documents: usize,
}

pub fn create_company_from_template(
    conn: &mut Conn<'_>,
    template: &CompanyBundle,
    tenant: &NewTenant,
) -> StoreResult<CreatedTenant> {
    if !template
        .documents
        .iter()
        .any(|document| document.file_type == FileType::Connection)
    {
        return Err(StoreError::invalid(format!(
            "template {} has no connection document",
            template.name
        )));
    }
    let password_hash = hash_password(&tenant.admin_password)?;

    conn.transaction(|tx| {
        let company = companies::create(
            tx,
            &NewCompany {
                name: tenant.name.clone(),
                display_name: tenant.display_name.clone(),
                subdomain: tenant.subdomain.clone(),
            },
        )?;

        let admin = users::create(
            tx,
            company.id,
            &NewUser {
                email: tenant.admin_email.clone(),
                name: tenant.admin_name.clone(),
                password_hash: Some(password_hash),
                phone: None,
                state: None,
                home_folder: String::new(),
                role: UserRole::Admin,
            },
        )?;

        for document in &template.documents {
            let mut copy = document.clone();
            copy.company_id = Some(company.id);
            copy.created_at = None;
            copy.updated_at = None;
            documents::insert_with_id(tx, company.id, &copy)?;
        }

        info!(
            company_id = company.id,
            template = %template.name,
            documents = template.documents.len(),
            "created company from template"
        );
        Ok(CreatedTenant {
            company,
            admin,
            documents: template.documents.len(),
        })
    })
}

//! Liveness check against the serving process.
//!
//! Maintenance commands must not rewrite a SQLite file that a running server
//! holds open, so they ask the server first.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use crate::adapter::Dialect;

#[async_trait]
pub trait ServerProbe: Send + Sync {
    /// Whether the server answers its health endpoint.
    async fn is_live(&self) -> bool;
}

pub struct HttpHealthProbe {
    client: Client,
    health_url: Url,
}

impl HttpHealthProbe {
    pub fn new(server_url: &Url, timeout: Duration) -> Result<Self> {
        let health_url = server_url.join("api/health")?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, health_url })
    }

    pub fn health_url(&self) -> &Url {
        &self.health_url
    }
}

#[async_trait]
impl ServerProbe for HttpHealthProbe {
    async fn is_live(&self) -> bool {
        match self.client.get(self.health_url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(url = %self.health_url, error = %err, "health probe failed");
                false
            }
        }
    }
}

/// Fails when the database is SQLite and the server is reachable.
pub async fn ensure_server_offline(dialect: Dialect, probe: &dyn ServerProbe) -> Result<()> {
    if dialect != Dialect::Sqlite {
        return Ok(());
    }
    if probe.is_live().await {
        bail!("the server is running; stop it before maintaining a sqlite database");
    }
    info!(component = "maintenance", "server is offline");
    Ok(())
}

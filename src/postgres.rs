// ABOUTME: PostgreSQL connection factory - short-lived, per-operation connections
// ABOUTME: Applies UTC session time zone and statement timeout to every session

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::{Client, Config};

use crate::error::{SyncError, SyncResult};
use crate::utils::strip_password_from_url;

/// Opens a fresh connection for each store operation.
///
/// Connections are never pooled or held across a backoff sleep: callers
/// connect, run their statements and drop the [`Client`], which closes the
/// session once the spawned connection task observes the drop.
#[derive(Clone)]
pub struct ConnectionFactory {
    config: Config,
    tls: MakeTlsConnector,
    display_url: String,
}

impl ConnectionFactory {
    pub fn new(url: &str, command_timeout: Duration) -> SyncResult<Self> {
        let mut config = Config::from_str(url).map_err(|e| {
            SyncError::Configuration(format!(
                "invalid connection string {}: {}",
                strip_password_from_url(url),
                e
            ))
        })?;

        let session_options = session_options(config.get_options(), command_timeout);
        config.options(&session_options);
        config.connect_timeout(command_timeout);
        if config.get_application_name().is_none() {
            config.application_name("watermark-sync");
        }

        let connector = TlsConnector::builder()
            .build()
            .map_err(|e| SyncError::Configuration(format!("failed to build TLS connector: {}", e)))?;

        Ok(Self {
            config,
            tls: MakeTlsConnector::new(connector),
            display_url: strip_password_from_url(url),
        })
    }

    /// The connection URL with its password masked.
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    pub async fn connect(&self) -> SyncResult<Client> {
        let (client, connection) = self.config.connect(self.tls.clone()).await.map_err(|e| {
            SyncError::Connectivity(format!("failed to connect to {}: {}", self.display_url, e))
        })?;

        let display_url = self.display_url.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("Connection to {} closed with error: {}", display_url, e);
            }
        });

        Ok(client)
    }
}

/// Merge our session settings into any `options` already present in the URL.
fn session_options(existing: Option<&str>, command_timeout: Duration) -> String {
    let ours = format!(
        "-c TimeZone=UTC -c statement_timeout={}",
        command_timeout.as_millis()
    );
    match existing {
        Some(existing) if !existing.trim().is_empty() => format!("{} {}", existing.trim(), ours),
        _ => ours,
    }
}

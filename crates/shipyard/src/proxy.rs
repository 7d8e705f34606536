use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, header};
use thiserror::Error;

use crate::config::ProxyConfig;

pub type DynProxyAdmin = Arc<dyn ProxyAdmin>;

/// Live-reload endpoint of the reverse proxy.
#[async_trait]
pub trait ProxyAdmin: Send + Sync {
    /// Replaces the running config; the proxy adopts it atomically or keeps the old one.
    async fn load(&self, config: &str) -> Result<(), ProxyError>;
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy admin request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("proxy rejected config ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
}

/// Caddy admin API client.
#[derive(Clone)]
pub struct CaddyAdmin {
    client: reqwest::Client,
    admin_url: String,
}

impl CaddyAdmin {
    pub fn new(cfg: &ProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            admin_url: cfg.admin_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProxyAdmin for CaddyAdmin {
    async fn load(&self, config: &str) -> Result<(), ProxyError> {
        let url = format!("{}/load", self.admin_url);
        let res = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(config.to_string())
            .send()
            .await
            .map_err(|source| ProxyError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ProxyError::Rejected {
                status,
                body: body.trim().to_string(),
            });
        }
        Ok(())
    }
}

use std::time::Duration;

use reqwest::{StatusCode, header};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::image::{INTERNAL_REGISTRY_HOST, ImageRef};
use crate::telemetry;
use crate::version;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

pub const DIGEST_HEADER: &str = "docker-content-digest";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("invalid tag list from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} did not return a docker-content-digest header")]
    MissingDigest { url: String },
}

/// How one image reference fared against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Range matched; reference pinned to the tag's digest.
    Pinned { tag: String, reference: String },
    /// Reference already carries a digest.
    AlreadyPinned(String),
    /// Not a range (no tag, `latest`, or a named tag).
    Skipped,
    /// Registry reachable but no tag satisfied the range.
    Miss,
}

impl Resolution {
    pub fn reference(&self) -> Option<&str> {
        match self {
            Resolution::Pinned { reference, .. } | Resolution::AlreadyPinned(reference) => {
                Some(reference)
            }
            Resolution::Skipped | Resolution::Miss => None,
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            Resolution::Pinned { .. } | Resolution::AlreadyPinned(_) => "pinned",
            Resolution::Skipped => "skipped",
            Resolution::Miss => "miss",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Registry HTTP API client used for tag listing and digest lookups.
#[derive(Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    internal_url: String,
    credentials: Option<(String, String)>,
}

impl RegistryClient {
    pub fn new(cfg: &RegistryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        let credentials = match (&cfg.username, &cfg.password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Ok(Self {
            client,
            internal_url: cfg.internal_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Base URL for registry API calls against `host`.
    pub fn base_url(&self, host: &str, registry_domain: &str) -> String {
        if self.is_internal(host, registry_domain) {
            self.internal_url.clone()
        } else {
            format!("https://{host}")
        }
    }

    fn is_internal(&self, host: &str, registry_domain: &str) -> bool {
        host == INTERNAL_REGISTRY_HOST
            || host == "registry"
            || host.eq_ignore_ascii_case(registry_domain)
    }

    fn request(&self, method: reqwest::Method, url: &str, internal: bool) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match (&self.credentials, internal) {
            (Some((user, pass)), true) => builder.basic_auth(user, Some(pass)),
            _ => builder,
        }
    }

    pub async fn list_tags(
        &self,
        image: &ImageRef,
        registry_domain: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let host = image.registry_host();
        let internal = self.is_internal(host, registry_domain);
        let url = format!(
            "{}/v2/{}/tags/list",
            self.base_url(host, registry_domain),
            image.api_repository()
        );
        let res = self
            .request(reqwest::Method::GET, &url, internal)
            .send()
            .await
            .map_err(|source| RegistryError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(RegistryError::Status { url, status, body });
        }

        let list: TagList = res
            .json()
            .await
            .map_err(|source| RegistryError::Decode {
                url: url.clone(),
                source,
            })?;
        Ok(list.tags.unwrap_or_default())
    }

    pub async fn manifest_digest(
        &self,
        image: &ImageRef,
        tag: &str,
        registry_domain: &str,
    ) -> Result<String, RegistryError> {
        let host = image.registry_host();
        let internal = self.is_internal(host, registry_domain);
        let url = format!(
            "{}/v2/{}/manifests/{tag}",
            self.base_url(host, registry_domain),
            image.api_repository()
        );
        let res = self
            .request(reqwest::Method::HEAD, &url, internal)
            .header(header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|source| RegistryError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                url,
                status,
                body: String::new(),
            });
        }

        res.headers()
            .get(DIGEST_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|digest| digest.trim().to_string())
            .filter(|digest| !digest.is_empty())
            .ok_or(RegistryError::MissingDigest { url })
    }

    pub async fn try_resolve(
        &self,
        reference: &str,
        registry_domain: &str,
    ) -> Result<Resolution, RegistryError> {
        let image = ImageRef::parse(reference);
        if image.digest.is_some() {
            return Ok(Resolution::AlreadyPinned(reference.to_string()));
        }
        let Some(range) = image.tag.as_deref() else {
            return Ok(Resolution::Skipped);
        };
        if range == "latest" || !version::looks_like_range(range) {
            return Ok(Resolution::Skipped);
        }

        let tags = self.list_tags(&image, registry_domain).await?;
        let Some(tag) = version::best_match(range, tags.iter().map(String::as_str)) else {
            debug!(%reference, available = tags.len(), "no tag satisfies range");
            return Ok(Resolution::Miss);
        };
        let digest = self.manifest_digest(&image, tag, registry_domain).await?;
        Ok(Resolution::Pinned {
            tag: tag.to_string(),
            reference: image.with_digest(&digest),
        })
    }

    /// Best effort: failures are logged and reported as `None`.
    pub async fn resolve_digest(&self, reference: &str, registry_domain: &str) -> Option<String> {
        match self.try_resolve(reference, registry_domain).await {
            Ok(resolution) => {
                telemetry::record_version_resolution(resolution.metric_label());
                match &resolution {
                    Resolution::Pinned { tag, reference: pinned } => {
                        info!(%reference, %tag, %pinned, "resolved image version")
                    }
                    Resolution::Miss => warn!(%reference, "no registry tag matches version range"),
                    Resolution::AlreadyPinned(_) | Resolution::Skipped => {}
                }
                resolution.reference().map(str::to_string)
            }
            Err(err) => {
                telemetry::record_version_resolution("error");
                warn!(%reference, error = %err, "version resolution failed; using reference as declared");
                None
            }
        }
    }
}

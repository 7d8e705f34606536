use std::collections::BTreeSet;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::resolver::ResolvedService;

pub mod caddy;
pub mod compose;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("failed to render compose manifest")]
    Compose(#[from] serde_yaml::Error),
    #[error("failed to render routing config")]
    Routing(#[from] serde_json::Error),
}

/// Both derived configs for one resolved service list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub compose: String,
    pub caddy: String,
}

impl Artifacts {
    pub fn render(
        services: &[ResolvedService],
        project: &str,
        email: &str,
    ) -> Result<Self, GenerateError> {
        Ok(Self {
            compose: compose::render(services, project)?,
            caddy: caddy::render(services, email)?,
        })
    }
}

pub fn fingerprint(contents: &str) -> String {
    let digest = Sha256::digest(contents.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("sha256:{hex}")
}

/// What changes when a new routing config replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub previous: Option<String>,
    pub current: String,
}

impl ConfigDiff {
    pub fn unchanged(&self) -> bool {
        self.previous.as_deref() == Some(self.current.as_str())
    }
}

/// Compares rendered routing configs; an unreadable previous config counts as empty.
pub fn diff_routing(previous: Option<&str>, current: &str) -> ConfigDiff {
    let domains = |raw: &str| -> BTreeSet<String> {
        serde_json::from_str(raw)
            .map(|value| caddy::routed_domains(&value))
            .unwrap_or_default()
    };
    let before = previous.map(domains).unwrap_or_default();
    let after = domains(current);

    ConfigDiff {
        added: after.difference(&before).cloned().collect(),
        removed: before.difference(&after).cloned().collect(),
        previous: previous.map(fingerprint),
        current: fingerprint(current),
    }
}

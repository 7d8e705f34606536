use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub mod compose;

pub type DynComposeRuntime = Arc<dyn ComposeRuntime>;

/// Run state and health as reported by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// `running`, `exited`, `restarting`, ...
    pub status: String,
    /// `healthy`, `unhealthy`, `starting`; `None` when no health check is declared.
    pub health: Option<String>,
}

impl ContainerState {
    pub fn new(status: impl Into<String>, health: Option<&str>) -> Self {
        Self {
            status: status.into(),
            health: health.map(str::to_string),
        }
    }

    pub fn health_label(&self) -> &str {
        self.health.as_deref().unwrap_or("none")
    }
}

/// The compose control plane: manifest validation, bring-up and inspection.
#[async_trait]
pub trait ComposeRuntime: Send + Sync {
    /// Syntax-checks a manifest without touching running services.
    async fn validate(&self, manifest: &Path) -> Result<(), ComposeError>;
    /// Brings the manifest up and waits for services to start.
    async fn up(&self, manifest: &Path) -> Result<(), ComposeError>;
    async fn inspect(&self, container: &str) -> Result<ContainerState, ComposeError>;
}

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("container {0} not found")]
    NotFound(String),
    #[error("unexpected inspect output for {container}: {output:?}")]
    Parse { container: String, output: String },
}

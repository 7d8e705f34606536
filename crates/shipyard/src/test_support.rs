//! Fixtures and in-memory collaborators shared by unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use common::api::{App, InfraBlock, Intent, SCHEMA_VERSION};
use reqwest::StatusCode;

use crate::config::{
    AppConfig, ComposeConfig, DnsConfig, HealthConfig, ImagesConfig, ProxyConfig, RegistryConfig,
    ServerConfig,
};
use crate::dns::DomainResolver;
use crate::proxy::{ProxyAdmin, ProxyError};
use crate::runtime::{ComposeError, ComposeRuntime, ContainerState};
use crate::validation::RESERVED_NAMES;

pub(crate) fn base_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 3000,
        },
        data_dir: "/var/lib/shipyard".into(),
        host_data_dir: "/var/lib/shipyard".into(),
        compose: ComposeConfig {
            binary: "docker".into(),
            project: "shipyard".into(),
        },
        proxy: ProxyConfig {
            admin_url: "http://caddy:2019".into(),
            request_timeout_secs: 2,
        },
        registry: RegistryConfig {
            internal_url: "http://registry:5000".into(),
            username: None,
            password: None,
            request_timeout_secs: 2,
        },
        dns: DnsConfig {
            enabled: true,
            timeout_secs: 1,
            poll_interval_ms: 20,
        },
        health: HealthConfig {
            timeout_secs: 1,
            poll_interval_ms: 10,
        },
        images: ImagesConfig {
            proxy: "caddy:2".into(),
            registry: "registry:2".into(),
            tower: "ghcr.io/shipyard/tower:latest".into(),
            otel: "grafana/otel-lgtm:latest".into(),
        },
    }
}

fn block(role: &str, username: &str) -> InfraBlock {
    InfraBlock {
        domain: format!("{role}.example.com"),
        username: username.into(),
        password_hash: format!("$2a$14${role}"),
    }
}

pub(crate) fn intent(apps: Vec<App>) -> Intent {
    Intent {
        version: SCHEMA_VERSION.into(),
        email: "ops@example.com".into(),
        data_dir: None,
        tower: block("tower", "admin"),
        registry: block("registry", "ci"),
        otel: block("otel", "admin"),
        apps,
    }
}

/// A public app on an image that never triggers version resolution.
pub(crate) fn app(name: &str, domain: &str) -> App {
    App {
        name: name.into(),
        image: format!("ghcr.io/acme/{name}:latest"),
        domain: domain.into(),
        port: None,
        env: Default::default(),
        secrets: Default::default(),
        health_check: None,
        auth: None,
    }
}

/// Compose runtime that records calls and reports scripted container states.
#[derive(Default)]
pub(crate) struct FakeCompose {
    states: Mutex<HashMap<String, ContainerState>>,
    inspect_calls: AtomicUsize,
    validate_calls: AtomicUsize,
    fail_validate: AtomicBool,
    fail_up: AtomicBool,
}

impl FakeCompose {
    pub(crate) fn set_state(&self, container: &str, state: ContainerState) {
        self.states
            .lock()
            .expect("states lock")
            .insert(container.to_string(), state);
    }

    pub(crate) fn inspect_calls(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_validate(&self, fail: bool) {
        self.fail_validate.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_up(&self, fail: bool) {
        self.fail_up.store(fail, Ordering::SeqCst);
    }
}

fn command_failed(action: &str) -> ComposeError {
    ComposeError::CommandFailed {
        command: format!("docker compose {action}"),
        status: "exit status: 1".into(),
        stderr: format!("{action} rejected"),
    }
}

#[async_trait]
impl ComposeRuntime for FakeCompose {
    async fn validate(&self, manifest: &Path) -> Result<(), ComposeError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        assert!(manifest.exists(), "validated manifest must exist on disk");
        if self.fail_validate.load(Ordering::SeqCst) {
            return Err(command_failed("config"));
        }
        Ok(())
    }

    async fn up(&self, _manifest: &Path) -> Result<(), ComposeError> {
        if self.fail_up.load(Ordering::SeqCst) {
            return Err(command_failed("up"));
        }
        Ok(())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, ComposeError> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        self.states
            .lock()
            .expect("states lock")
            .get(container)
            .cloned()
            .ok_or_else(|| ComposeError::NotFound(container.to_string()))
    }
}

/// Marks every infrastructure container and the named apps as running.
pub(crate) fn healthy_stack(runtime: &FakeCompose, apps: &[&str]) {
    for name in RESERVED_NAMES.iter().chain(apps) {
        runtime.set_state(name, ContainerState::new("running", None));
    }
}

#[derive(Default)]
pub(crate) struct FakeProxy {
    loaded: Mutex<Option<String>>,
    reject: AtomicBool,
}

impl FakeProxy {
    pub(crate) fn last_loaded(&self) -> Option<String> {
        self.loaded.lock().expect("proxy lock").clone()
    }

    pub(crate) fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProxyAdmin for FakeProxy {
    async fn load(&self, config: &str) -> Result<(), ProxyError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ProxyError::Rejected {
                status: StatusCode::BAD_REQUEST,
                body: "invalid config".into(),
            });
        }
        *self.loaded.lock().expect("proxy lock") = Some(config.to_string());
        Ok(())
    }
}

/// Answers every lookup the same way.
pub(crate) struct StaticResolver(pub bool);

#[async_trait]
impl DomainResolver for StaticResolver {
    async fn resolves(&self, _domain: &str) -> std::io::Result<bool> {
        Ok(self.0)
    }
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use shipyard::app_state::AppState;
use shipyard::apply::Reconciler;
use shipyard::config::{
    AppConfig, ComposeConfig, DnsConfig, HealthConfig, ImagesConfig, ProxyConfig, RegistryConfig,
    ServerConfig,
};
use shipyard::dns::DomainResolver;
use shipyard::proxy::{ProxyAdmin, ProxyError};
use shipyard::registry::RegistryClient;
use shipyard::runtime::{ComposeError, ComposeRuntime, ContainerState};
use shipyard::telemetry::init_metrics_recorder;
use tempfile::TempDir;
use tower::ServiceExt;

pub fn test_config(data_dir: &Path, registry_url: &str) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 3000,
        },
        data_dir: data_dir.display().to_string(),
        host_data_dir: "/srv/shipyard".into(),
        compose: ComposeConfig {
            binary: "docker".into(),
            project: "shipyard".into(),
        },
        proxy: ProxyConfig {
            admin_url: "http://caddy:2019".into(),
            request_timeout_secs: 2,
        },
        registry: RegistryConfig {
            internal_url: registry_url.into(),
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

pub fn intent_json(apps: Value) -> Value {
    json!({
        "version": "1",
        "email": "ops@example.com",
        "tower": {"domain": "tower.example.com", "username": "admin", "passwordHash": "$2a$14$tower"},
        "registry": {"domain": "registry.example.com", "username": "ci", "passwordHash": "$2a$14$registry"},
        "otel": {"domain": "otel.example.com", "username": "admin", "passwordHash": "$2a$14$otel"},
        "apps": apps
    })
}

/// Every container reports running unless told otherwise.
#[derive(Default)]
pub struct StubCompose {
    overrides: Mutex<HashMap<String, ContainerState>>,
    reject_manifest: AtomicBool,
}

impl StubCompose {
    pub fn set_state(&self, container: &str, state: ContainerState) {
        self.overrides
            .lock()
            .unwrap()
            .insert(container.to_string(), state);
    }

    pub fn reject_manifest(&self, reject: bool) {
        self.reject_manifest.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl ComposeRuntime for StubCompose {
    async fn validate(&self, _manifest: &Path) -> Result<(), ComposeError> {
        if self.reject_manifest.load(Ordering::SeqCst) {
            return Err(ComposeError::CommandFailed {
                command: "docker compose config --quiet".into(),
                status: "exit status: 15".into(),
                stderr: "services.api.image must be a string".into(),
            });
        }
        Ok(())
    }

    async fn up(&self, _manifest: &Path) -> Result<(), ComposeError> {
        Ok(())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, ComposeError> {
        Ok(self
            .overrides
            .lock()
            .unwrap()
            .get(container)
            .cloned()
            .unwrap_or_else(|| ContainerState::new("running", None)))
    }
}

#[derive(Default)]
pub struct RecordingProxy {
    loaded: Mutex<Vec<String>>,
}

impl RecordingProxy {
    pub fn last(&self) -> Option<Value> {
        self.loaded
            .lock()
            .unwrap()
            .last()
            .map(|raw| serde_json::from_str(raw).unwrap())
    }
}

#[async_trait]
impl ProxyAdmin for RecordingProxy {
    async fn load(&self, config: &str) -> Result<(), ProxyError> {
        self.loaded.lock().unwrap().push(config.to_string());
        Ok(())
    }
}

pub struct AlwaysResolves;

#[async_trait]
impl DomainResolver for AlwaysResolves {
    async fn resolves(&self, _domain: &str) -> std::io::Result<bool> {
        Ok(true)
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub runtime: Arc<StubCompose>,
    pub proxy: Arc<RecordingProxy>,
    pub dir: TempDir,
}

impl TestApp {
    pub fn new(registry_url: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(&dir.path().join("data"), registry_url);
        let runtime = Arc::new(StubCompose::default());
        let proxy = Arc::new(RecordingProxy::default());
        let registry = RegistryClient::new(&cfg.registry).unwrap();
        let reconciler = Reconciler::new(
            Arc::new(cfg),
            runtime.clone(),
            proxy.clone(),
            Arc::new(AlwaysResolves),
            registry,
        );
        let state = AppState::new(reconciler, init_metrics_recorder());
        let router = shipyard::http::build_router(state.clone());
        Self {
            router,
            state,
            runtime,
            proxy,
            dir,
        }
    }

    pub fn data_file(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join("data").join(name)).ok()
    }

    pub async fn send(&self, method: &str, uri: &str, body: Option<&Value>) -> TestResponse {
        let body = match body {
            Some(value) => Body::from(serde_json::to_vec(value).unwrap()),
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        TestResponse {
            status,
            request_id,
            body: String::from_utf8_lossy(&bytes).to_string(),
        }
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub request_id: Option<String>,
    pub body: String,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }

    pub fn last_line(&self) -> &str {
        self.body.lines().last().unwrap_or_default()
    }
}

use std::collections::BTreeMap;
use std::fmt;

use common::api::{App, AuthPolicy, AuthScope, Credential, InfraBlock, Intent};
use futures_util::{StreamExt, stream};

use crate::config::AppConfig;
use crate::image;
use crate::registry::RegistryClient;

pub const NETWORK_NAME: &str = "shipyard";
pub const PROXY_SERVICE: &str = "caddy";
pub const PROXY_ADMIN_PORT: u16 = 2019;
pub const REGISTRY_PORT: u16 = 5000;
pub const OTEL_PORT: u16 = 3000;
pub const OTEL_COLLECTOR_ENDPOINT: &str = "http://otel:4318";
const TOWER_CONTAINER_DATA_DIR: &str = "/var/lib/shipyard";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const INFRA_HEALTH_INTERVAL_SECS: u32 = 10;
const INFRA_HEALTH_TIMEOUT_SECS: u32 = 5;
const INFRA_HEALTH_RETRIES: u32 = 3;
const RESOLVE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Infra,
    App,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Infra => "infra",
            ServiceKind::App => "app",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxy target on the shared network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAuth {
    pub policy: AuthPolicy,
    pub accounts: Vec<Credential>,
    pub scopes: Vec<AuthScope>,
}

impl ServiceAuth {
    fn public() -> Self {
        Self {
            policy: AuthPolicy::None,
            accounts: Vec::new(),
            scopes: Vec::new(),
        }
    }

    fn basic(policy: AuthPolicy, block: &InfraBlock) -> Self {
        Self {
            policy,
            accounts: vec![block.credential()],
            scopes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHealth {
    pub path: String,
    pub port: u16,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub retries: u32,
}

impl ServiceHealth {
    fn infra(path: &str, port: u16) -> Self {
        Self {
            path: path.to_string(),
            port,
            interval_secs: INFRA_HEALTH_INTERVAL_SECS,
            timeout_secs: INFRA_HEALTH_TIMEOUT_SECS,
            retries: INFRA_HEALTH_RETRIES,
        }
    }
}

/// One deployable unit, infrastructure or app, recomputed on every apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub name: String,
    pub kind: ServiceKind,
    /// Public domain; `None` for services that are not routed.
    pub domain: Option<String>,
    pub port: u16,
    pub upstream: Option<Upstream>,
    /// Normalized image reference as declared.
    pub image: String,
    /// Digest-pinned reference when version resolution succeeded.
    pub image_digest: Option<String>,
    pub auth: ServiceAuth,
    pub env: BTreeMap<String, String>,
    pub health: Option<ServiceHealth>,
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
    pub command: Option<Vec<String>>,
}

impl ResolvedService {
    /// Reference written to the compose manifest.
    pub fn deploy_image(&self) -> &str {
        self.image_digest.as_deref().unwrap_or(&self.image)
    }
}

/// Host directory for infrastructure volumes.
pub fn host_data_dir<'a>(intent: &'a Intent, cfg: &'a AppConfig) -> &'a str {
    intent
        .data_dir
        .as_deref()
        .unwrap_or(&cfg.host_data_dir)
        .trim_end_matches('/')
}

/// Builds the service list without contacting any registry.
pub fn plan(intent: &Intent, cfg: &AppConfig) -> Vec<ResolvedService> {
    let mut services = infra_services(intent, cfg);
    services.extend(intent.apps.iter().map(|app| app_service(app, intent)));
    services
}

/// Builds the service list and pins app images to registry digests where possible.
pub async fn resolve(
    intent: &Intent,
    cfg: &AppConfig,
    registry: &RegistryClient,
) -> Vec<ResolvedService> {
    let registry_domain = intent.registry.domain.as_str();
    let services = plan(intent, cfg);

    stream::iter(services)
        .map(|mut service| async move {
            if service.kind == ServiceKind::App {
                service.image_digest = registry
                    .resolve_digest(&service.image, registry_domain)
                    .await;
            }
            service
        })
        .buffered(RESOLVE_CONCURRENCY)
        .collect()
        .await
}

/// App name to the reference that will be deployed.
pub fn digest_map(services: &[ResolvedService]) -> BTreeMap<String, String> {
    services
        .iter()
        .filter(|service| service.kind == ServiceKind::App)
        .map(|service| (service.name.clone(), service.deploy_image().to_string()))
        .collect()
}

fn infra_services(intent: &Intent, cfg: &AppConfig) -> Vec<ResolvedService> {
    let host_dir = host_data_dir(intent, cfg);
    let tower_port = cfg.server.port;

    let proxy = ResolvedService {
        name: PROXY_SERVICE.to_string(),
        kind: ServiceKind::Infra,
        domain: None,
        port: PROXY_ADMIN_PORT,
        upstream: None,
        image: cfg.images.proxy.clone(),
        image_digest: None,
        auth: ServiceAuth::public(),
        env: BTreeMap::from([(
            "CADDY_ADMIN".to_string(),
            format!("0.0.0.0:{PROXY_ADMIN_PORT}"),
        )]),
        health: None,
        volumes: vec![
            format!("{host_dir}/caddy/data:/data"),
            format!("{host_dir}/caddy/config:/config"),
        ],
        ports: vec!["80:80".to_string(), "443:443".to_string()],
        // Resume the last config pushed through the admin API after a restart.
        command: Some(vec!["caddy".into(), "run".into(), "--resume".into()]),
    };

    let registry = ResolvedService {
        name: "registry".to_string(),
        kind: ServiceKind::Infra,
        domain: Some(intent.registry.domain.clone()),
        port: REGISTRY_PORT,
        upstream: Some(Upstream {
            host: "registry".into(),
            port: REGISTRY_PORT,
        }),
        image: cfg.images.registry.clone(),
        image_digest: None,
        auth: ServiceAuth::basic(AuthPolicy::BasicWriteOnly, &intent.registry),
        env: BTreeMap::new(),
        health: Some(ServiceHealth::infra("/v2/", REGISTRY_PORT)),
        volumes: vec![format!("{host_dir}/registry:/var/lib/registry")],
        ports: Vec::new(),
        command: None,
    };

    let tower = ResolvedService {
        name: "tower".to_string(),
        kind: ServiceKind::Infra,
        domain: Some(intent.tower.domain.clone()),
        port: tower_port,
        upstream: Some(Upstream {
            host: "tower".into(),
            port: tower_port,
        }),
        image: cfg.images.tower.clone(),
        image_digest: None,
        auth: ServiceAuth::basic(AuthPolicy::BasicAll, &intent.tower),
        env: BTreeMap::from([
            (
                "SHIPYARD_DATA_DIR".to_string(),
                TOWER_CONTAINER_DATA_DIR.to_string(),
            ),
            ("SHIPYARD_HOST_DATA_DIR".to_string(), host_dir.to_string()),
            ("SHIPYARD_SERVER_PORT".to_string(), tower_port.to_string()),
        ]),
        health: Some(ServiceHealth::infra("/health", tower_port)),
        volumes: vec![
            format!("{DOCKER_SOCKET}:{DOCKER_SOCKET}"),
            format!("{host_dir}/tower:{TOWER_CONTAINER_DATA_DIR}"),
        ],
        ports: Vec::new(),
        command: None,
    };

    let otel = ResolvedService {
        name: "otel".to_string(),
        kind: ServiceKind::Infra,
        domain: Some(intent.otel.domain.clone()),
        port: OTEL_PORT,
        upstream: Some(Upstream {
            host: "otel".into(),
            port: OTEL_PORT,
        }),
        image: cfg.images.otel.clone(),
        image_digest: None,
        auth: ServiceAuth::basic(AuthPolicy::BasicAll, &intent.otel),
        env: BTreeMap::new(),
        health: Some(ServiceHealth::infra("/api/health", OTEL_PORT)),
        volumes: vec![format!("{host_dir}/otel:/data")],
        ports: Vec::new(),
        command: None,
    };

    vec![proxy, registry, tower, otel]
}

fn app_service(app: &App, intent: &Intent) -> ResolvedService {
    let port = app.effective_port();

    let mut env = BTreeMap::from([
        (
            "OTEL_EXPORTER_OTLP_ENDPOINT".to_string(),
            OTEL_COLLECTOR_ENDPOINT.to_string(),
        ),
        ("OTEL_SERVICE_NAME".to_string(), app.name.clone()),
    ]);
    // App keys override the baseline; env and secrets are disjoint after validation.
    env.extend(app.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(app.secrets.iter().map(|(k, v)| (k.clone(), v.clone())));

    let health = app.health_check.as_ref().map(|health| ServiceHealth {
        path: health.effective_path().to_string(),
        port: health
            .port
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(port),
        interval_secs: health.effective_interval(),
        timeout_secs: health.effective_timeout(),
        retries: health.effective_retries(),
    });

    let auth = match &app.auth {
        Some(auth) if auth.policy != AuthPolicy::None => ServiceAuth {
            policy: auth.policy,
            accounts: if auth.accounts.is_empty() {
                vec![intent.tower.credential()]
            } else {
                auth.accounts.clone()
            },
            scopes: auth.scopes.clone(),
        },
        _ => ServiceAuth::public(),
    };

    ResolvedService {
        name: app.name.clone(),
        kind: ServiceKind::App,
        domain: Some(app.domain.clone()),
        port,
        upstream: Some(Upstream {
            host: app.name.clone(),
            port,
        }),
        image: image::normalize(&app.image, &intent.registry.domain),
        image_digest: None,
        auth,
        env,
        health,
        volumes: Vec::new(),
        ports: Vec::new(),
        command: None,
    }
}

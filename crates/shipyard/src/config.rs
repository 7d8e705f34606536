use std::env;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Directory the reconciler writes its manifest, routing config and applied record into.
    pub data_dir: String,
    /// Host path used for generated volume mounts; may differ from `data_dir`
    /// when the reconciler itself runs in a container.
    pub host_data_dir: String,
    pub compose: ComposeConfig,
    pub proxy: ProxyConfig,
    pub registry: RegistryConfig,
    pub dns: DnsConfig,
    pub health: HealthConfig,
    pub images: ImagesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComposeConfig {
    /// Container CLI providing the `compose` subcommand.
    pub binary: String,
    pub project: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Origin of the reverse proxy's admin API.
    pub admin_url: String,
    #[serde(default = "default_proxy_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// In-network address of the private registry.
    pub internal_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    pub proxy: String,
    pub registry: String,
    pub tower: String,
    pub otel: String,
}

impl AppConfig {
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.data_dir.trim().is_empty() {
            anyhow::bail!("data_dir cannot be empty");
        }
        if self.host_data_dir.trim().is_empty() {
            anyhow::bail!("host_data_dir cannot be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("server.port must be > 0");
        }
        self.compose.validate()?;
        for (field, raw) in [
            ("proxy.admin_url", &self.proxy.admin_url),
            ("registry.internal_url", &self.registry.internal_url),
        ] {
            let url = reqwest::Url::parse(raw)
                .map_err(|err| anyhow::anyhow!("{field} is not a valid URL ({raw}): {err}"))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("{field} must use http or https: {raw}");
            }
        }
        if self.proxy.request_timeout_secs == 0 {
            anyhow::bail!("proxy.request_timeout_secs must be > 0");
        }
        if self.registry.request_timeout_secs == 0 {
            anyhow::bail!("registry.request_timeout_secs must be > 0");
        }
        if self.dns.timeout_secs == 0 {
            anyhow::bail!("dns.timeout_secs must be > 0");
        }
        if self.dns.poll_interval_ms == 0
            || self.dns.poll_interval_ms >= self.dns.timeout_secs.saturating_mul(1000)
        {
            anyhow::bail!("dns.poll_interval_ms must be > 0 and shorter than dns.timeout_secs");
        }
        if self.health.timeout_secs == 0 {
            anyhow::bail!("health.timeout_secs must be > 0");
        }
        if self.health.poll_interval_ms == 0
            || self.health.poll_interval_ms >= self.health.timeout_secs.saturating_mul(1000)
        {
            anyhow::bail!(
                "health.poll_interval_ms must be > 0 and shorter than health.timeout_secs"
            );
        }
        for (field, image) in [
            ("images.proxy", &self.images.proxy),
            ("images.registry", &self.images.registry),
            ("images.tower", &self.images.tower),
            ("images.otel", &self.images.otel),
        ] {
            if image.trim().is_empty() {
                anyhow::bail!("{field} cannot be empty");
            }
        }
        Ok(())
    }
}

impl ComposeConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.binary.trim().is_empty() {
            anyhow::bail!("compose.binary cannot be empty");
        }
        if self.project.trim().is_empty() {
            anyhow::bail!("compose.project cannot be empty");
        }
        if !self
            .project
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            anyhow::bail!(
                "compose.project must contain only lowercase letters, digits, '-' or '_': {}",
                self.project
            );
        }
        Ok(())
    }
}

fn default_proxy_timeout_secs() -> u64 {
    10
}

// (ENV_NAME, config_key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("SHIPYARD_SERVER_HOST", "server.host"),
    ("SHIPYARD_SERVER_PORT", "server.port"),
    ("SHIPYARD_DATA_DIR", "data_dir"),
    ("SHIPYARD_HOST_DATA_DIR", "host_data_dir"),
    ("SHIPYARD_COMPOSE_BINARY", "compose.binary"),
    ("SHIPYARD_COMPOSE_PROJECT", "compose.project"),
    ("SHIPYARD_PROXY_ADMIN_URL", "proxy.admin_url"),
    (
        "SHIPYARD_PROXY_REQUEST_TIMEOUT_SECS",
        "proxy.request_timeout_secs",
    ),
    ("SHIPYARD_REGISTRY_INTERNAL_URL", "registry.internal_url"),
    ("SHIPYARD_REGISTRY_USERNAME", "registry.username"),
    ("SHIPYARD_REGISTRY_PASSWORD", "registry.password"),
    (
        "SHIPYARD_REGISTRY_REQUEST_TIMEOUT_SECS",
        "registry.request_timeout_secs",
    ),
    ("SHIPYARD_DNS_ENABLED", "dns.enabled"),
    ("SHIPYARD_DNS_TIMEOUT_SECS", "dns.timeout_secs"),
    ("SHIPYARD_DNS_POLL_INTERVAL_MS", "dns.poll_interval_ms"),
    ("SHIPYARD_HEALTH_TIMEOUT_SECS", "health.timeout_secs"),
    ("SHIPYARD_HEALTH_POLL_INTERVAL_MS", "health.poll_interval_ms"),
    ("SHIPYARD_IMAGES_PROXY", "images.proxy"),
    ("SHIPYARD_IMAGES_REGISTRY", "images.registry"),
    ("SHIPYARD_IMAGES_TOWER", "images.tower"),
    ("SHIPYARD_IMAGES_OTEL", "images.otel"),
];

pub fn load() -> anyhow::Result<AppConfig> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("shipyard").required(false))
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 3000)?
        .set_default("data_dir", "/var/lib/shipyard")?
        .set_default("compose.binary", "docker")?
        .set_default("compose.project", "shipyard")?
        .set_default("proxy.admin_url", "http://caddy:2019")?
        .set_default("proxy.request_timeout_secs", default_proxy_timeout_secs())?
        .set_default("registry.internal_url", "http://registry:5000")?
        .set_default("registry.request_timeout_secs", 10)?
        .set_default("dns.enabled", true)?
        .set_default("dns.timeout_secs", 30)?
        .set_default("dns.poll_interval_ms", 2_000)?
        .set_default("health.timeout_secs", 120)?
        .set_default("health.poll_interval_ms", 2_000)?
        .set_default("images.proxy", "caddy:2")?
        .set_default("images.registry", "registry:2")?
        .set_default("images.tower", "ghcr.io/shipyard/tower:latest")?
        .set_default("images.otel", "grafana/otel-lgtm:latest")?;

    for (env_key, cfg_key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            builder = builder.set_override(*cfg_key, value)?;
        }
    }

    let cfg = builder.build()?;
    let mut raw: RawConfig = cfg.try_deserialize()?;
    let host_data_dir = raw
        .host_data_dir
        .take()
        .map(|dir| dir.trim().to_string())
        .filter(|dir| !dir.is_empty())
        .unwrap_or_else(|| raw.data_dir.clone());

    let app = AppConfig {
        server: raw.server,
        data_dir: raw.data_dir,
        host_data_dir,
        compose: raw.compose,
        proxy: raw.proxy,
        registry: raw.registry,
        dns: raw.dns,
        health: raw.health,
        images: raw.images,
    };
    app.validate()?;
    Ok(app)
}

/// Deserialization shape before `host_data_dir` falls back to `data_dir`.
#[derive(Debug, Deserialize)]
struct RawConfig {
    server: ServerConfig,
    data_dir: String,
    #[serde(default)]
    host_data_dir: Option<String>,
    compose: ComposeConfig,
    proxy: ProxyConfig,
    registry: RegistryConfig,
    dns: DnsConfig,
    health: HealthConfig,
    images: ImagesConfig,
}

//! Intent documents and the applied-state record shared by the reconciler and its clients.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The only intent schema version this release understands.
pub const SCHEMA_VERSION: &str = "1";
/// Port an app listens on when the intent does not say otherwise.
pub const DEFAULT_APP_PORT: u16 = 3000;
/// Seconds between container health checks.
pub const DEFAULT_HEALTH_INTERVAL_SECS: u32 = 10;
/// Seconds before one health check attempt fails.
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u32 = 5;
/// Consecutive failures before a container is unhealthy.
pub const DEFAULT_HEALTH_RETRIES: u32 = 3;
/// HTTP path probed when a health check omits one.
pub const DEFAULT_HEALTH_PATH: &str = "/";

/// Declarative desired state for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Intent {
    /// Schema version; must equal [`SCHEMA_VERSION`].
    pub version: String,
    /// Contact used for ACME certificate registration.
    pub email: String,
    /// Host directory for infrastructure volumes, overriding the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// The reconciler itself.
    pub tower: InfraBlock,
    /// The private image registry.
    pub registry: InfraBlock,
    /// The observability stack.
    pub otel: InfraBlock,
    /// User applications, in declaration order.
    #[serde(default)]
    pub apps: Vec<App>,
}

impl Intent {
    /// Infrastructure blocks keyed by their fixed role name.
    pub fn infra_blocks(&self) -> [(InfraRole, &InfraBlock); 3] {
        [
            (InfraRole::Tower, &self.tower),
            (InfraRole::Registry, &self.registry),
            (InfraRole::Otel, &self.otel),
        ]
    }
}

/// Fixed infrastructure roles that own a public domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfraRole {
    /// The reconciler's own dashboard and API.
    Tower,
    /// Private image registry.
    Registry,
    /// Observability stack.
    Otel,
}

impl InfraRole {
    /// Returns the canonical lowercase representation (also the service name).
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraRole::Tower => "tower",
            InfraRole::Registry => "registry",
            InfraRole::Otel => "otel",
        }
    }
}

impl std::fmt::Display for InfraRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain and operator credential of one infrastructure service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InfraBlock {
    /// Public domain routed to the service.
    pub domain: String,
    /// Basic-auth user name.
    pub username: String,
    /// bcrypt hash, passed through to the proxy untouched.
    pub password_hash: String,
}

impl InfraBlock {
    /// The block's basic-auth account.
    pub fn credential(&self) -> Credential {
        Credential {
            username: self.username.clone(),
            password_hash: self.password_hash.clone(),
        }
    }
}

/// Basic-auth account accepted by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Credential {
    /// Account name.
    pub username: String,
    /// bcrypt hash of the password.
    pub password_hash: String,
}

/// One user-declared application service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct App {
    /// Service and container name.
    pub name: String,
    /// Image reference; may carry a version range, exact tag, digest, or the
    /// `registry://` prefix.
    pub image: String,
    /// Public domain routed to the app.
    pub domain: String,
    /// Kept wider than `u16` so out-of-range ports surface as validation
    /// errors rather than decode failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    /// Plain environment variables.
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    /// Secret environment variables; keys must not collide with `env`.
    pub secrets: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Container health check, if any.
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Basic-auth protection in front of the app.
    pub auth: Option<AppAuth>,
}

impl App {
    /// Listening port; only meaningful once the intent has been validated.
    pub fn effective_port(&self) -> u16 {
        self.port
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(DEFAULT_APP_PORT)
    }
}

/// Container health check declared for an app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheck {
    /// HTTP path to probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Defaults to the app port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    /// Seconds between checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    /// Seconds before a single check is considered failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Consecutive failures tolerated.
    pub retries: Option<u32>,
}

impl HealthCheck {
    /// Probe path with the default applied.
    pub fn effective_path(&self) -> &str {
        self.path.as_deref().unwrap_or(DEFAULT_HEALTH_PATH)
    }

    /// Interval with the default applied.
    pub fn effective_interval(&self) -> u32 {
        self.interval.unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS)
    }

    /// Timeout with the default applied.
    pub fn effective_timeout(&self) -> u32 {
        self.timeout.unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECS)
    }

    /// Retries with the default applied.
    pub fn effective_retries(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_HEALTH_RETRIES)
    }
}

/// Which requests to a domain must present basic-auth credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPolicy {
    /// Public.
    #[default]
    None,
    /// Every request is authenticated.
    BasicAll,
    /// Only mutating requests are authenticated.
    BasicWriteOnly,
    /// Only requests matching one of the declared scopes are authenticated.
    BasicScoped,
}

impl AuthPolicy {
    /// Returns the canonical snake_case representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthPolicy::None => "none",
            AuthPolicy::BasicAll => "basic_all",
            AuthPolicy::BasicWriteOnly => "basic_write_only",
            AuthPolicy::BasicScoped => "basic_scoped",
        }
    }
}

/// Basic-auth settings for one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppAuth {
    /// Which requests are protected.
    pub policy: AuthPolicy,
    /// Falls back to the tower credential when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<Credential>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// Request matchers for [`AuthPolicy::BasicScoped`].
    pub scopes: Vec<AuthScope>,
}

/// Method/path matcher pair selecting protected requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthScope {
    /// HTTP methods, upper case.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// Path patterns as understood by the proxy.
    pub paths: Vec<String>,
}

impl AuthScope {
    /// True when the scope matches nothing specific.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.paths.is_empty()
    }
}

/// Durable record of the last successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedIntent {
    /// The intent exactly as applied.
    pub intent: Intent,
    /// When the apply finished.
    pub applied_at: DateTime<Utc>,
    /// App name to the image reference that was deployed (digest when pinned).
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent_json() -> serde_json::Value {
        json!({
            "version": "1",
            "email": "ops@example.com",
            "tower": {"domain": "tower.example.com", "username": "admin", "passwordHash": "$2a$h1"},
            "registry": {"domain": "registry.example.com", "username": "ci", "passwordHash": "$2a$h2"},
            "otel": {"domain": "otel.example.com", "username": "admin", "passwordHash": "$2a$h3"},
            "apps": [{
                "name": "api",
                "image": "registry://api:^1.0.0",
                "domain": "api.example.com",
                "healthCheck": {"path": "/health"}
            }]
        })
    }

    #[test]
    fn intent_decodes_camel_case_and_applies_defaults() {
        let intent: Intent = serde_json::from_value(intent_json()).expect("decode");
        assert_eq!(intent.registry.password_hash, "$2a$h2");
        let app = &intent.apps[0];
        assert_eq!(app.effective_port(), DEFAULT_APP_PORT);
        assert!(app.auth.is_none());
        let health = app.health_check.as_ref().expect("health");
        assert_eq!(health.effective_interval(), 10);
        assert_eq!(health.effective_timeout(), 5);
        assert_eq!(health.effective_retries(), 3);
    }

    #[test]
    fn intent_rejects_unknown_fields() {
        let mut raw = intent_json();
        raw["surprise"] = json!(true);
        let err = serde_json::from_value::<Intent>(raw).unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");
    }

    #[test]
    fn optional_fields_are_omitted_when_serialized() {
        let intent: Intent = serde_json::from_value(intent_json()).expect("decode");
        let encoded = serde_json::to_value(&intent).expect("encode");
        let app = &encoded["apps"][0];
        assert!(app.get("port").is_none());
        assert!(app.get("env").is_none());
        assert!(app.get("auth").is_none());
        assert!(encoded.get("dataDir").is_none());
    }

    #[test]
    fn auth_policy_uses_snake_case_on_the_wire() {
        let policy: AuthPolicy = serde_json::from_value(json!("basic_write_only")).expect("policy");
        assert_eq!(policy, AuthPolicy::BasicWriteOnly);
        assert_eq!(policy.as_str(), "basic_write_only");
    }
}

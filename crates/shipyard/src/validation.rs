use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use common::api::{App, AuthScope, HealthCheck, InfraBlock, Intent, SCHEMA_VERSION};
use thiserror::Error;

/// Service names owned by the fixed infrastructure stack.
pub const RESERVED_NAMES: &[&str] = &["caddy", "registry", "tower", "otel"];

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed intent: {0}")]
    Malformed(String),
    #[error("unsupported intent version {0:?} (expected \"1\")")]
    UnsupportedVersion(String),
    #[error("invalid admin email {0:?}")]
    InvalidEmail(String),
    #[error("dataDir must be an absolute path: {0}")]
    InvalidDataDir(String),
    #[error("{owner}: invalid domain {domain:?}")]
    InvalidDomain { owner: String, domain: String },
    #[error("{owner}: {field} cannot be empty")]
    EmptyCredential { owner: String, field: &'static str },
    #[error("invalid app name {0:?}: use lowercase letters, digits, '-' or '_'")]
    InvalidAppName(String),
    #[error("duplicate app name {0:?}")]
    DuplicateAppName(String),
    #[error("app name {0:?} is reserved for infrastructure")]
    ReservedAppName(String),
    #[error("domain {domain} is used by both {first} and {second}")]
    DomainConflict {
        domain: String,
        first: String,
        second: String,
    },
    #[error("{app}: port {port} is outside 1-65535")]
    InvalidPort { app: String, port: u32 },
    #[error("{app}: {key:?} is not a valid environment variable name")]
    InvalidEnvKey { app: String, key: String },
    #[error("{app}: {key} is declared in both env and secrets")]
    EnvSecretOverlap { app: String, key: String },
    #[error("{app}: invalid health check: {reason}")]
    InvalidHealthCheck { app: String, reason: String },
    #[error("{app}: invalid image reference {image:?}: {reason}")]
    InvalidImage {
        app: String,
        image: String,
        reason: &'static str,
    },
    #[error("{app}: invalid auth: {reason}")]
    InvalidAuth { app: String, reason: String },
}

/// Every problem found in one intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentErrors(Vec<ValidationError>);

impl IntentErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    pub fn contains(&self, predicate: impl Fn(&ValidationError) -> bool) -> bool {
        self.0.iter().any(predicate)
    }
}

impl From<Vec<ValidationError>> for IntentErrors {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self(errors)
    }
}

impl fmt::Display for IntentErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid intent: ")?;
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for IntentErrors {}

/// Decode raw JSON and validate it.
pub fn parse(raw: &[u8]) -> Result<Intent, IntentErrors> {
    let intent: Intent = serde_json::from_slice(raw)
        .map_err(|err| IntentErrors(vec![ValidationError::Malformed(err.to_string())]))?;
    validate(intent)
}

/// Validates a decoded intent, returning it with domains lowercased.
pub fn validate(mut intent: Intent) -> Result<Intent, IntentErrors> {
    normalize(&mut intent);

    let mut errors = Vec::new();
    if intent.version != SCHEMA_VERSION {
        errors.push(ValidationError::UnsupportedVersion(intent.version.clone()));
    }
    if !is_valid_email(&intent.email) {
        errors.push(ValidationError::InvalidEmail(intent.email.clone()));
    }
    if let Some(dir) = intent.data_dir.as_deref()
        && !Path::new(dir).is_absolute()
    {
        errors.push(ValidationError::InvalidDataDir(dir.to_string()));
    }

    // domain -> first owner
    let mut domains: HashMap<&str, String> = HashMap::new();
    for (role, block) in intent.infra_blocks() {
        validate_infra_block(role.as_str(), block, &mut errors);
        claim_domain(&mut domains, &block.domain, role.as_str(), &mut errors);
    }

    let mut names: HashMap<&str, usize> = HashMap::new();
    for app in &intent.apps {
        let seen = names.entry(app.name.as_str()).or_default();
        *seen += 1;
        if *seen == 2 {
            errors.push(ValidationError::DuplicateAppName(app.name.clone()));
        }
        validate_app(app, &mut errors);
        claim_domain(&mut domains, &app.domain, &app.name, &mut errors);
    }

    if errors.is_empty() {
        Ok(intent)
    } else {
        Err(IntentErrors(errors))
    }
}

fn normalize(intent: &mut Intent) {
    for block in [&mut intent.tower, &mut intent.registry, &mut intent.otel] {
        block.domain = block.domain.trim().to_ascii_lowercase();
    }
    for app in &mut intent.apps {
        app.domain = app.domain.trim().to_ascii_lowercase();
    }
}

fn claim_domain<'a>(
    domains: &mut HashMap<&'a str, String>,
    domain: &'a str,
    owner: &str,
    errors: &mut Vec<ValidationError>,
) {
    if domain.is_empty() {
        return;
    }
    match domains.get(domain) {
        Some(first) => errors.push(ValidationError::DomainConflict {
            domain: domain.to_string(),
            first: first.clone(),
            second: owner.to_string(),
        }),
        None => {
            domains.insert(domain, owner.to_string());
        }
    }
}

fn validate_infra_block(owner: &str, block: &InfraBlock, errors: &mut Vec<ValidationError>) {
    if !is_valid_domain(&block.domain) {
        errors.push(ValidationError::InvalidDomain {
            owner: owner.to_string(),
            domain: block.domain.clone(),
        });
    }
    if block.username.trim().is_empty() {
        errors.push(ValidationError::EmptyCredential {
            owner: owner.to_string(),
            field: "username",
        });
    }
    if block.password_hash.trim().is_empty() {
        errors.push(ValidationError::EmptyCredential {
            owner: owner.to_string(),
            field: "passwordHash",
        });
    }
}

fn validate_app(app: &App, errors: &mut Vec<ValidationError>) {
    if !is_valid_app_name(&app.name) {
        errors.push(ValidationError::InvalidAppName(app.name.clone()));
    }
    if RESERVED_NAMES.contains(&app.name.as_str()) {
        errors.push(ValidationError::ReservedAppName(app.name.clone()));
    }
    if !is_valid_domain(&app.domain) {
        errors.push(ValidationError::InvalidDomain {
            owner: app.name.clone(),
            domain: app.domain.clone(),
        });
    }
    if let Some(port) = app.port
        && !is_valid_port(port)
    {
        errors.push(ValidationError::InvalidPort {
            app: app.name.clone(),
            port,
        });
    }
    if let Err(reason) = check_image_reference(&app.image) {
        errors.push(ValidationError::InvalidImage {
            app: app.name.clone(),
            image: app.image.clone(),
            reason,
        });
    }
    validate_env(app, errors);
    if let Some(health) = &app.health_check {
        for reason in health_check_problems(health) {
            errors.push(ValidationError::InvalidHealthCheck {
                app: app.name.clone(),
                reason,
            });
        }
    }
    if let Some(auth) = &app.auth {
        for account in &auth.accounts {
            if account.username.trim().is_empty() || account.password_hash.trim().is_empty() {
                errors.push(ValidationError::InvalidAuth {
                    app: app.name.clone(),
                    reason: "accounts need a username and passwordHash".into(),
                });
            }
        }
        for scope in &auth.scopes {
            if let Some(reason) = scope_problem(scope) {
                errors.push(ValidationError::InvalidAuth {
                    app: app.name.clone(),
                    reason,
                });
            }
        }
    }
}

fn validate_env(app: &App, errors: &mut Vec<ValidationError>) {
    let keys = app.env.keys().chain(app.secrets.keys());
    for key in keys {
        if !is_valid_env_key(key) {
            errors.push(ValidationError::InvalidEnvKey {
                app: app.name.clone(),
                key: key.clone(),
            });
        }
    }
    for key in overlapping_keys(&app.env, &app.secrets) {
        errors.push(ValidationError::EnvSecretOverlap {
            app: app.name.clone(),
            key: key.to_string(),
        });
    }
}

fn overlapping_keys<'a>(
    env: &'a BTreeMap<String, String>,
    secrets: &BTreeMap<String, String>,
) -> impl Iterator<Item = &'a str> {
    env.keys()
        .filter(|key| secrets.contains_key(*key))
        .map(String::as_str)
}

fn health_check_problems(health: &HealthCheck) -> Vec<String> {
    let mut problems = Vec::new();
    let interval = health.effective_interval();
    let timeout = health.effective_timeout();
    let retries = health.effective_retries();

    if !health.effective_path().starts_with('/') {
        problems.push(format!("path {:?} must start with '/'", health.effective_path()));
    }
    if let Some(port) = health.port
        && !is_valid_port(port)
    {
        problems.push(format!("port {port} is outside 1-65535"));
    }
    if !(1..=300).contains(&interval) {
        problems.push(format!("interval {interval}s must be within 1-300s"));
    }
    if !(1..=60).contains(&timeout) {
        problems.push(format!("timeout {timeout}s must be within 1-60s"));
    }
    if timeout >= interval {
        problems.push(format!(
            "timeout {timeout}s must be shorter than interval {interval}s"
        ));
    }
    if retries > 10 {
        problems.push(format!("retries {retries} must be within 0-10"));
    }
    problems
}

fn scope_problem(scope: &AuthScope) -> Option<String> {
    if let Some(method) = scope.methods.iter().find(|m| !is_http_token(m)) {
        return Some(format!("scope method {method:?} is not an HTTP method token"));
    }
    if let Some(path) = scope.paths.iter().find(|p| !p.starts_with('/')) {
        return Some(format!("scope path {path:?} must start with '/'"));
    }
    None
}

fn is_valid_port(port: u32) -> bool {
    (1..=65_535).contains(&port)
}

/// Dot-joined labels of `[a-z0-9]([a-z0-9-]*[a-z0-9])?`.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

fn is_valid_app_name(name: &str) -> bool {
    let separator = |c: char| c == '-' || c == '_';
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || separator(c))
        && !name.starts_with(separator)
        && !name.ends_with(separator)
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.rsplit_once('@') else {
        return false;
    };
    !local.is_empty()
        && !local.contains(char::is_whitespace)
        && !local.contains('@')
        && domain.contains('.')
        && is_valid_domain(&domain.to_ascii_lowercase())
}

fn is_http_token(method: &str) -> bool {
    !method.is_empty()
        && method
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c))
}

fn check_image_reference(image: &str) -> Result<(), &'static str> {
    if image.trim().is_empty() {
        return Err("reference is empty");
    }
    if image.contains(char::is_whitespace) {
        return Err("reference contains whitespace");
    }
    let without_scheme = image
        .strip_prefix(crate::image::REGISTRY_SCHEME)
        .unwrap_or(image);
    let name = without_scheme
        .split_once('@')
        .map(|(name, _)| name)
        .unwrap_or(without_scheme);
    let last = name.rsplit('/').next().unwrap_or_default();
    let repo = last.split_once(':').map(|(repo, _)| repo).unwrap_or(last);
    if repo.is_empty() {
        return Err("final path segment is empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{app, intent};
    use common::api::{AppAuth, AuthPolicy};

    #[test]
    fn valid_intent_passes() {
        let validated = validate(intent(vec![app("api", "api.example.com")])).expect("valid");
        assert_eq!(validated.apps.len(), 1);
    }

    #[test]
    fn validate_round_trips_through_serialization() {
        let mut raw = intent(vec![app("api", "API.Example.com")]);
        raw.tower.domain = "Tower.Example.COM".into();
        let once = validate(raw).expect("valid");
        let encoded = serde_json::to_vec(&once).expect("encode");
        let twice = parse(&encoded).expect("valid again");
        assert_eq!(once, twice);
        assert_eq!(twice.apps[0].domain, "api.example.com");
    }

    #[test]
    fn domain_reuse_is_reported_for_every_pairing() {
        let mut raw = intent(vec![
            app("api", "registry.example.com"),
            app("web", "shop.example.com"),
            app("shop", "shop.example.com"),
        ]);
        raw.otel.domain = raw.tower.domain.clone();
        let errors = validate(raw).unwrap_err();
        let conflicts: Vec<_> = errors
            .errors()
            .iter()
            .filter(|err| matches!(err, ValidationError::DomainConflict { .. }))
            .collect();
        assert_eq!(conflicts.len(), 3, "{errors}");
        assert!(errors.contains(|err| matches!(
            err,
            ValidationError::DomainConflict { first, second, .. } if first == "tower" && second == "otel"
        )));
    }

    #[test]
    fn duplicate_and_reserved_names_are_rejected() {
        let errors = validate(intent(vec![
            app("api", "a.example.com"),
            app("api", "b.example.com"),
            app("registry", "c.example.com"),
        ]))
        .unwrap_err();
        assert!(errors.contains(|err| *err == ValidationError::DuplicateAppName("api".into())));
        assert!(errors.contains(|err| *err == ValidationError::ReservedAppName("registry".into())));
    }

    #[test]
    fn app_names_follow_token_grammar() {
        assert!(is_valid_app_name("api"));
        assert!(is_valid_app_name("my_app-2"));
        for bad in ["", "-api", "api_", "Api", "a.b", "a b"] {
            assert!(!is_valid_app_name(bad), "{bad}");
        }
    }

    #[test]
    fn domains_follow_label_grammar() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("a-1.b2.example.com"));
        for bad in ["", "-a.com", "a-.com", "a..com", "a_b.com", "exa mple.com"] {
            assert!(!is_valid_domain(bad), "{bad}");
        }
    }

    #[test]
    fn per_app_checks_all_run() {
        let mut bad = app("api", "api.example.com");
        bad.port = Some(70_000);
        bad.image = "ghcr.io/acme/".into();
        bad.env.insert("1BAD".into(), "x".into());
        bad.env.insert("TOKEN".into(), "a".into());
        bad.secrets.insert("TOKEN".into(), "b".into());
        let errors = validate(intent(vec![bad])).unwrap_err();

        assert!(errors.contains(|err| matches!(err, ValidationError::InvalidPort { port: 70_000, .. })));
        assert!(errors.contains(|err| matches!(err, ValidationError::InvalidImage { .. })));
        assert!(errors.contains(|err| matches!(err, ValidationError::InvalidEnvKey { key, .. } if key == "1BAD")));
        assert!(errors.contains(|err| matches!(err, ValidationError::EnvSecretOverlap { key, .. } if key == "TOKEN")));
    }

    #[test]
    fn image_reference_rules() {
        assert!(check_image_reference("nginx").is_ok());
        assert!(check_image_reference("registry://api:^1.0.0").is_ok());
        assert!(check_image_reference("ghcr.io/acme/api@sha256:abc").is_ok());
        assert!(check_image_reference("").is_err());
        assert!(check_image_reference("ngi nx").is_err());
        assert!(check_image_reference("registry://").is_err());
        assert!(check_image_reference("acme/:1.0").is_err());
    }

    #[test]
    fn health_check_bounds() {
        let ok = HealthCheck {
            path: Some("/health".into()),
            ..HealthCheck::default()
        };
        assert!(health_check_problems(&ok).is_empty());

        let bad = HealthCheck {
            path: Some("health".into()),
            port: Some(0),
            interval: Some(5),
            timeout: Some(5),
            retries: Some(11),
        };
        let problems = health_check_problems(&bad);
        assert_eq!(problems.len(), 4, "{problems:?}");

        let too_long = HealthCheck {
            interval: Some(301),
            timeout: Some(61),
            ..HealthCheck::default()
        };
        let problems = health_check_problems(&too_long);
        assert!(problems.iter().any(|p| p.contains("1-300s")), "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("1-60s")), "{problems:?}");
    }

    #[test]
    fn header_fields_are_checked() {
        let mut raw = intent(Vec::new());
        raw.version = "2".into();
        raw.email = "not-an-email".into();
        raw.data_dir = Some("relative/dir".into());
        raw.registry.password_hash = " ".into();
        let errors = validate(raw).unwrap_err();
        assert_eq!(errors.errors().len(), 4, "{errors}");
        assert!(errors.to_string().starts_with("invalid intent: "));
    }

    #[test]
    fn auth_scopes_are_checked() {
        let mut scoped = app("api", "api.example.com");
        scoped.auth = Some(AppAuth {
            policy: AuthPolicy::BasicScoped,
            accounts: Vec::new(),
            scopes: vec![AuthScope {
                methods: vec!["PO ST".into()],
                paths: vec!["admin".into()],
            }],
        });
        let errors = validate(intent(vec![scoped])).unwrap_err();
        assert!(errors.contains(|err| matches!(err, ValidationError::InvalidAuth { .. })));
    }

    #[test]
    fn parse_reports_decode_failures() {
        let errors = parse(br#"{"version": "1"}"#).unwrap_err();
        assert!(matches!(errors.errors()[0], ValidationError::Malformed(_)));
    }
}

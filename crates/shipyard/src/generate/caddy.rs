//! Caddy JSON config: one TLS automation policy for every routed domain, one
//! host-matched terminal route per domain, and a plain-HTTP server that
//! redirects everything to HTTPS.

use std::collections::BTreeSet;

use common::api::{AuthPolicy, AuthScope, Credential};
use serde_json::{Value, json};

use crate::resolver::{PROXY_ADMIN_PORT, ResolvedService, ServiceAuth};

/// Mutating verbs under the registry API, protected by `basic_write_only`.
const WRITE_METHODS: [&str; 4] = ["POST", "PUT", "PATCH", "DELETE"];
const WRITE_PATHS: [&str; 1] = ["/v2/*"];

/// A routed domain as it appears in the generated config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSummary {
    pub domain: String,
    pub upstream: String,
    pub auth: AuthPolicy,
}

/// Services that get a public route, in declaration order.
pub fn routes(services: &[ResolvedService]) -> Vec<RouteSummary> {
    services
        .iter()
        .filter_map(|service| {
            let domain = service.domain.as_ref()?;
            let upstream = service.upstream.as_ref()?;
            Some(RouteSummary {
                domain: domain.clone(),
                upstream: upstream.to_string(),
                auth: effective_policy(&service.auth),
            })
        })
        .collect()
}

pub fn render_value(services: &[ResolvedService], email: &str) -> Value {
    let subjects: BTreeSet<&str> = services
        .iter()
        .filter(|service| service.upstream.is_some())
        .filter_map(|service| service.domain.as_deref())
        .collect();

    let https_routes: Vec<Value> = services
        .iter()
        .filter_map(|service| {
            let domain = service.domain.as_deref()?;
            let upstream = service.upstream.as_ref()?;
            Some(route(domain, &upstream.to_string(), &service.auth))
        })
        .collect();

    json!({
        "admin": {"listen": format!("0.0.0.0:{PROXY_ADMIN_PORT}")},
        "apps": {
            "tls": {
                "automation": {
                    "policies": [{
                        "subjects": subjects,
                        "issuers": [{"module": "acme", "email": email}],
                    }],
                },
            },
            "http": {
                "servers": {
                    "https": {
                        "listen": [":443"],
                        "routes": https_routes,
                        "automatic_https": {"disable_redirects": true},
                    },
                    "http": {
                        "listen": [":80"],
                        "routes": [{
                            "handle": [{
                                "handler": "static_response",
                                "status_code": 308,
                                "headers": {
                                    "Location": ["https://{http.request.host}{http.request.uri}"],
                                },
                            }],
                            "terminal": true,
                        }],
                    },
                },
            },
        },
    })
}

/// Pretty-printed config; key order is stable so equal inputs give equal bytes.
pub fn render(services: &[ResolvedService], email: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&render_value(services, email))
}

/// Domains routed by a previously rendered config.
pub fn routed_domains(config: &Value) -> BTreeSet<String> {
    config
        .pointer("/apps/http/servers/https/routes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|route| route.pointer("/match/0/host")?.as_array())
        .flatten()
        .filter_map(|host| host.as_str().map(str::to_string))
        .collect()
}

fn route(domain: &str, upstream: &str, auth: &ServiceAuth) -> Value {
    let proxy = reverse_proxy(upstream);
    let handle = match effective_policy(auth) {
        AuthPolicy::None => vec![proxy],
        AuthPolicy::BasicAll => vec![authentication(&auth.accounts), proxy],
        AuthPolicy::BasicWriteOnly | AuthPolicy::BasicScoped => {
            let mut branches: Vec<Value> = protected_scopes(auth)
                .iter()
                .map(|scope| {
                    json!({
                        "match": [scope_matcher(scope)],
                        "handle": [authentication(&auth.accounts), proxy.clone()],
                    })
                })
                .collect();
            branches.push(json!({"handle": [proxy]}));
            vec![json!({"handler": "subroute", "routes": branches})]
        }
    };

    json!({
        "match": [{"host": [domain]}],
        "handle": handle,
        "terminal": true,
    })
}

/// Scoped policies without a usable scope protect everything instead.
fn effective_policy(auth: &ServiceAuth) -> AuthPolicy {
    match auth.policy {
        AuthPolicy::BasicWriteOnly | AuthPolicy::BasicScoped if protected_scopes(auth).is_empty() => {
            AuthPolicy::BasicAll
        }
        policy => policy,
    }
}

fn protected_scopes(auth: &ServiceAuth) -> Vec<AuthScope> {
    let declared: Vec<AuthScope> = auth
        .scopes
        .iter()
        .filter(|scope| !scope.is_empty())
        .cloned()
        .collect();
    match auth.policy {
        AuthPolicy::BasicWriteOnly if declared.is_empty() => vec![AuthScope {
            methods: WRITE_METHODS.iter().map(|m| m.to_string()).collect(),
            paths: WRITE_PATHS.iter().map(|p| p.to_string()).collect(),
        }],
        AuthPolicy::BasicWriteOnly | AuthPolicy::BasicScoped => declared,
        AuthPolicy::None | AuthPolicy::BasicAll => Vec::new(),
    }
}

fn scope_matcher(scope: &AuthScope) -> Value {
    let mut matcher = serde_json::Map::new();
    if !scope.methods.is_empty() {
        let methods: Vec<String> = scope.methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        matcher.insert("method".into(), json!(methods));
    }
    if !scope.paths.is_empty() {
        matcher.insert("path".into(), json!(scope.paths));
    }
    Value::Object(matcher)
}

fn authentication(accounts: &[Credential]) -> Value {
    let accounts: Vec<Value> = accounts
        .iter()
        .map(|account| {
            json!({
                "username": account.username,
                "password": account.password_hash,
            })
        })
        .collect();
    json!({
        "handler": "authentication",
        "providers": {
            "http_basic": {
                "accounts": accounts,
                "hash": {"algorithm": "bcrypt"},
            },
        },
    })
}

fn reverse_proxy(upstream: &str) -> Value {
    json!({
        "handler": "reverse_proxy",
        "upstreams": [{"dial": upstream}],
    })
}

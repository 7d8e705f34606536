use std::collections::BTreeMap;

use serde::Serialize;

use crate::resolver::{NETWORK_NAME, ResolvedService, ServiceHealth};

const RESTART_POLICY: &str = "unless-stopped";

#[derive(Debug, Serialize)]
struct ComposeFile<'a> {
    name: &'a str,
    services: BTreeMap<&'a str, ComposeService<'a>>,
    networks: BTreeMap<&'static str, ComposeNetwork>,
}

#[derive(Debug, Serialize)]
struct ComposeNetwork {
    name: &'static str,
}

#[derive(Debug, Serialize)]
struct ComposeService<'a> {
    image: &'a str,
    container_name: &'a str,
    restart: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<&'a str, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<Vec<String>>,
    networks: [&'static str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcheck: Option<Healthcheck>,
}

#[derive(Debug, Serialize)]
struct Healthcheck {
    test: [String; 2],
    interval: String,
    timeout: String,
    retries: u32,
}

impl Healthcheck {
    fn from_service(health: &ServiceHealth) -> Self {
        Self {
            test: [
                "CMD-SHELL".to_string(),
                format!(
                    "wget -q --spider http://localhost:{}{} || exit 1",
                    health.port, health.path
                ),
            ],
            interval: format!("{}s", health.interval_secs),
            timeout: format!("{}s", health.timeout_secs),
            retries: health.retries,
        }
    }
}

/// Renders the compose manifest for `services` under the given project name.
pub fn render(services: &[ResolvedService], project: &str) -> Result<String, serde_yaml::Error> {
    let services = services
        .iter()
        .map(|service| {
            let compose = ComposeService {
                image: service.deploy_image(),
                container_name: &service.name,
                restart: RESTART_POLICY,
                environment: service
                    .env
                    .iter()
                    .map(|(key, value)| (key.as_str(), escape_interpolation(value)))
                    .collect(),
                ports: service.ports.clone(),
                volumes: service.volumes.clone(),
                command: service.command.clone(),
                networks: [NETWORK_NAME],
                healthcheck: service.health.as_ref().map(Healthcheck::from_service),
            };
            (service.name.as_str(), compose)
        })
        .collect();

    let file = ComposeFile {
        name: project,
        services,
        networks: BTreeMap::from([(NETWORK_NAME, ComposeNetwork { name: NETWORK_NAME })]),
    };
    serde_yaml::to_string(&file)
}

/// Compose treats `$` as variable interpolation; literal values need `$$`.
fn escape_interpolation(value: &str) -> String {
    value.replace('$', "$$")
}

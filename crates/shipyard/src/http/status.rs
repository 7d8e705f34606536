use std::collections::BTreeMap;

use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use common::api::AuthPolicy;
use serde::Serialize;
use tracing::debug;

use crate::app_state::AppState;
use crate::error::ApiResult;
use crate::generate::caddy;
use crate::health;
use crate::resolver;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Serialize)]
pub(crate) struct StatusResponse {
    pub applied: Option<AppliedSummary>,
    pub services: Vec<ServiceStatus>,
    pub routes: Vec<RouteStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AppliedSummary {
    pub applied_at: DateTime<Utc>,
    pub digests: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ServiceStatus {
    pub name: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub state: String,
    pub health: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RouteStatus {
    pub domain: String,
    pub upstream: String,
    pub auth: AuthPolicy,
}

pub fn router() -> Router<AppState> {
    Router::<AppState>::new().route("/status", get(status))
}

/// Last applied intent, live container state and the routing table.
pub(crate) async fn status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let reconciler = &state.reconciler;
    let Some(applied) = reconciler.store().load_applied()? else {
        return Ok(Json(StatusResponse {
            applied: None,
            services: Vec::new(),
            routes: Vec::new(),
        }));
    };

    let planned = resolver::plan(&applied.intent, reconciler.config());
    let names: Vec<String> = planned.iter().map(|service| service.name.clone()).collect();
    let states = health::inspect_all(reconciler.runtime(), &names).await;

    let services = planned
        .iter()
        .zip(states)
        .map(|(service, (name, inspected))| {
            let (state, health) = match inspected {
                Ok(container) => (container.status.clone(), container.health_label().to_string()),
                Err(err) => {
                    debug!(container = %name, error = %err, "inspect failed");
                    (UNKNOWN.to_string(), UNKNOWN.to_string())
                }
            };
            ServiceStatus {
                name,
                kind: service.kind.as_str(),
                domain: service.domain.clone(),
                state,
                health,
            }
        })
        .collect();

    let routes = caddy::routes(&planned)
        .into_iter()
        .map(|route| RouteStatus {
            domain: route.domain,
            upstream: route.upstream,
            auth: route.auth,
        })
        .collect();

    Ok(Json(StatusResponse {
        applied: Some(AppliedSummary {
            applied_at: applied.applied_at,
            digests: applied.digests,
        }),
        services,
        routes,
    }))
}

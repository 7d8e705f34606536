use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use crate::runtime::{ComposeError, ComposeRuntime, ContainerState};

#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("containers failed: {}", .details.join(", "))]
    Failed {
        containers: Vec<String>,
        details: Vec<String>,
    },
    #[error("containers not healthy after {timeout_secs}s: {}", .pending.join(", "))]
    Timeout {
        pending: Vec<String>,
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Pending,
    Failed,
}

/// Running with a passing (or no) health check is healthy; exited or unhealthy is final.
pub fn classify(state: &ContainerState) -> Verdict {
    if matches!(state.status.as_str(), "exited" | "dead")
        || state.health.as_deref() == Some("unhealthy")
    {
        return Verdict::Failed;
    }
    match (state.status.as_str(), state.health.as_deref()) {
        ("running", None | Some("healthy")) => Verdict::Healthy,
        _ => Verdict::Pending,
    }
}

/// Current state of every container, inspected concurrently.
pub async fn inspect_all(
    runtime: &dyn ComposeRuntime,
    containers: &[String],
) -> Vec<(String, Result<ContainerState, ComposeError>)> {
    let checks = containers.iter().map(|name| async move {
        let state = runtime.inspect(name).await;
        (name.clone(), state)
    });
    join_all(checks).await
}

/// Polls until every container is healthy, any container fails, or `budget` elapses.
///
/// Each round of inspections is bounded by the remaining budget, so a stalled
/// runtime call ends in `Timeout` naming whatever had not yet reported healthy.
pub async fn wait_healthy(
    runtime: &dyn ComposeRuntime,
    containers: &[String],
    budget: Duration,
    poll_interval: Duration,
) -> Result<(), HealthCheckError> {
    if containers.is_empty() {
        return Ok(());
    }
    let deadline = Instant::now() + budget;
    let mut pending = containers.to_vec();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Ok(states) = timeout(remaining, inspect_all(runtime, containers)).await else {
            debug!(pending = ?pending, "container inspection exceeded the health budget");
            return Err(HealthCheckError::Timeout {
                pending,
                timeout_secs: budget.as_secs(),
            });
        };

        pending.clear();
        let mut failed = Vec::new();
        let mut details = Vec::new();
        for (name, state) in states {
            match state {
                Ok(state) => match classify(&state) {
                    Verdict::Healthy => {}
                    Verdict::Pending => pending.push(name),
                    Verdict::Failed => {
                        details.push(format!("{name} ({}/{})", state.status, state.health_label()));
                        failed.push(name);
                    }
                },
                Err(err) => {
                    debug!(container = %name, error = %err, "inspect failed; retrying");
                    pending.push(name);
                }
            }
        }

        if !failed.is_empty() {
            return Err(HealthCheckError::Failed {
                containers: failed,
                details,
            });
        }
        if pending.is_empty() {
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HealthCheckError::Timeout {
                pending,
                timeout_secs: budget.as_secs(),
            });
        }
        debug!(pending = ?pending, "waiting for containers to become healthy");
        sleep(poll_interval.min(remaining)).await;
    }
}

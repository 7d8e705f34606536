use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::apply::Reconciler;
use crate::error::{ApiResult, AppError};

/// Held for the duration of one apply or refresh.
pub type ApplyGuard = OwnedMutexGuard<()>;

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub metrics_handle: PrometheusHandle,
    apply_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(reconciler: Reconciler, metrics_handle: PrometheusHandle) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            metrics_handle,
            apply_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Claims the apply slot, or reports a conflict while another apply runs.
    pub fn try_begin_apply(&self) -> ApiResult<ApplyGuard> {
        self.apply_lock.clone().try_lock_owned().map_err(|_| {
            AppError::conflict("apply_in_progress", "another apply is already running")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryClient;
    use crate::telemetry::init_metrics_recorder;
    use crate::test_support::{FakeCompose, FakeProxy, StaticResolver, base_config};
    use axum::http::StatusCode;

    fn state() -> AppState {
        let cfg = base_config();
        let registry = RegistryClient::new(&cfg.registry).expect("registry");
        let reconciler = Reconciler::new(
            Arc::new(cfg),
            Arc::new(FakeCompose::default()),
            Arc::new(FakeProxy::default()),
            Arc::new(StaticResolver(true)),
            registry,
        );
        AppState::new(reconciler, init_metrics_recorder())
    }

    #[test]
    fn only_one_apply_at_a_time() {
        let state = state();
        let guard = state.try_begin_apply().expect("first apply");

        let err = state.clone().try_begin_apply().unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "apply_in_progress");

        drop(guard);
        state.try_begin_apply().expect("slot released");
    }
}

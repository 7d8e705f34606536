use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

/// Outcome of one apply; `stage` is the stage that failed, or `done`.
pub fn record_apply_result(result: &str, stage: &str, duration: Duration) {
    counter!(
        "shipyard_apply_total",
        "result" => result.to_string(),
        "stage" => stage.to_string()
    )
    .increment(1);
    histogram!(
        "shipyard_apply_duration_ms",
        "result" => result.to_string()
    )
    .record(duration.as_secs_f64() * 1000.0);
}

/// One of `pinned`, `miss`, `error` or `skipped`.
pub fn record_version_resolution(result: &str) {
    counter!(
        "shipyard_version_resolution_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_dns_gate(result: &str) {
    counter!(
        "shipyard_dns_gate_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_health_gate(result: &str) {
    counter!(
        "shipyard_health_gate_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_proxy_reload(result: &str) {
    counter!(
        "shipyard_proxy_reload_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_managed_services(count: usize) {
    gauge!("shipyard_managed_services").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_counters_carry_result_and_stage_labels() {
        let handle = init_metrics_recorder();
        record_apply_result("error", "dns", Duration::from_millis(12));
        record_apply_result("success", "done", Duration::from_millis(40));

        let body = handle.render();
        assert!(
            body.contains("shipyard_apply_total{result=\"error\",stage=\"dns\"}"),
            "metrics payload missing failed apply counter: {body}"
        );
        assert!(
            body.contains("shipyard_apply_duration_ms"),
            "metrics payload missing apply duration: {body}"
        );
    }

    #[test]
    fn gate_counters_are_rendered() {
        let handle = init_metrics_recorder();
        record_version_resolution("pinned");
        record_dns_gate("success");
        record_health_gate("timeout");
        record_proxy_reload("success");
        record_managed_services(5);

        let body = handle.render();
        for series in [
            "shipyard_version_resolution_total{result=\"pinned\"}",
            "shipyard_dns_gate_total{result=\"success\"}",
            "shipyard_health_gate_total{result=\"timeout\"}",
            "shipyard_proxy_reload_total{result=\"success\"}",
            "shipyard_managed_services",
        ] {
            assert!(body.contains(series), "missing {series}: {body}");
        }
    }
}

//! The apply pipeline.
//!
//! Stages run strictly in order and each one finishes (including its internal
//! fan-out) before the next begins. The first failing stage ends the run; nothing
//! already done is undone, so the host stays at its last known good state. The
//! applied-intent record is written last and only after every other stage
//! succeeded.

use std::collections::BTreeMap;
use std::error::Error as _;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::api::{AppliedIntent, Intent};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::dns::{self, DnsError, DynDomainResolver};
use crate::generate::{self, Artifacts, GenerateError};
use crate::health::{self, HealthCheckError};
use crate::progress::ProgressSink;
use crate::proxy::{DynProxyAdmin, ProxyError};
use crate::registry::RegistryClient;
use crate::resolver::{self, ResolvedService, ServiceKind};
use crate::runtime::{ComposeError, ComposeRuntime, DynComposeRuntime};
use crate::store::{Store, StoreError};
use crate::telemetry;
use crate::validation::{self, IntentErrors};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyStage {
    Validating,
    Resolving,
    DnsGating,
    Generating,
    ValidatingConfig,
    Applying,
    HealthGating,
    ReloadingProxy,
    Persisting,
    Done,
}

impl ApplyStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyStage::Validating => "validating",
            ApplyStage::Resolving => "resolving",
            ApplyStage::DnsGating => "dns_gating",
            ApplyStage::Generating => "generating",
            ApplyStage::ValidatingConfig => "validating_config",
            ApplyStage::Applying => "applying",
            ApplyStage::HealthGating => "health_gating",
            ApplyStage::ReloadingProxy => "reloading_proxy",
            ApplyStage::Persisting => "persisting",
            ApplyStage::Done => "done",
        }
    }
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ApplyErrorKind {
    #[error(transparent)]
    Invalid(#[from] IntentErrors),
    #[error(transparent)]
    Dns(#[from] DnsError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Health(#[from] HealthCheckError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A failed apply and the stage it failed in.
#[derive(Debug, Error)]
#[error("[{stage}] {kind}")]
pub struct ApplyError {
    pub stage: ApplyStage,
    #[source]
    pub kind: ApplyErrorKind,
}

impl ApplyError {
    pub fn new(stage: ApplyStage, kind: impl Into<ApplyErrorKind>) -> Self {
        Self {
            stage,
            kind: kind.into(),
        }
    }

    pub fn validation_errors(&self) -> Option<&IntentErrors> {
        match &self.kind {
            ApplyErrorKind::Invalid(errors) => Some(errors),
            _ => None,
        }
    }

    /// The failure and its causes on one line.
    pub fn reason(&self) -> String {
        let mut reason = self.kind.to_string();
        let mut source = self.kind.source();
        while let Some(err) = source {
            let message = err.to_string();
            if !reason.contains(&message) {
                reason.push_str(": ");
                reason.push_str(&message);
            }
            source = err.source();
        }
        reason
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Services in the deployed manifest, infrastructure included.
    pub services: usize,
    pub digests: BTreeMap<String, String>,
    pub applied_at: DateTime<Utc>,
}

/// Drives intents through the apply pipeline against one host.
pub struct Reconciler {
    config: Arc<AppConfig>,
    runtime: DynComposeRuntime,
    proxy: DynProxyAdmin,
    dns: DynDomainResolver,
    registry: RegistryClient,
    store: Store,
}

impl Reconciler {
    pub fn new(
        config: Arc<AppConfig>,
        runtime: DynComposeRuntime,
        proxy: DynProxyAdmin,
        dns: DynDomainResolver,
        registry: RegistryClient,
    ) -> Self {
        let store = Store::new(config.data_path());
        Self {
            config,
            runtime,
            proxy,
            dns,
            registry,
            store,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn runtime(&self) -> &dyn ComposeRuntime {
        self.runtime.as_ref()
    }

    /// Runs one full apply. Progress goes to `sink`, which is dropped when the
    /// apply finishes so listeners see the channel close.
    pub async fn apply(
        &self,
        intent: Intent,
        sink: ProgressSink,
    ) -> Result<ApplyOutcome, ApplyError> {
        let started = Instant::now();
        let result = self.run(intent, &sink).await;
        match &result {
            Ok(outcome) => {
                telemetry::record_apply_result("success", ApplyStage::Done.as_str(), started.elapsed());
                telemetry::record_managed_services(outcome.services);
                info!(
                    services = outcome.services,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "apply finished"
                );
            }
            Err(err) => {
                telemetry::record_apply_result("error", err.stage.as_str(), started.elapsed());
                error!(stage = %err.stage, reason = %err.reason(), "apply failed");
            }
        }
        result
    }

    async fn run(&self, intent: Intent, sink: &ProgressSink) -> Result<ApplyOutcome, ApplyError> {
        let cfg = self.config.as_ref();

        let stage = ApplyStage::Validating;
        sink.info(stage, "validating intent");
        let intent = validation::validate(intent).map_err(|err| ApplyError::new(stage, err))?;

        let stage = ApplyStage::Resolving;
        sink.info(stage, format!("resolving {} apps", intent.apps.len()));
        let services = resolver::resolve(&intent, cfg, &self.registry).await;
        report_resolution(&services, sink);

        let stage = ApplyStage::DnsGating;
        self.dns_gate(&services, sink)
            .await
            .map_err(|err| ApplyError::new(stage, err))?;

        let stage = ApplyStage::Generating;
        let artifacts = Artifacts::render(&services, &cfg.compose.project, &intent.email)
            .map_err(|err| ApplyError::new(stage, err))?;
        let previous_manifest = self.store.read_compose().map_err(|err| ApplyError::new(stage, err))?;
        let manifest_fingerprint = generate::fingerprint(&artifacts.compose);
        if previous_manifest.as_deref().map(generate::fingerprint).as_deref()
            == Some(manifest_fingerprint.as_str())
        {
            sink.info(stage, format!("compose manifest {manifest_fingerprint} (unchanged)"));
        } else {
            sink.info(stage, format!("compose manifest {manifest_fingerprint}"));
        }

        let stage = ApplyStage::ValidatingConfig;
        sink.info(stage, "checking compose manifest");
        let staged = self
            .store
            .stage_compose(&artifacts.compose)
            .map_err(|err| ApplyError::new(stage, err))?;
        if let Err(err) = self.runtime.validate(staged.path()).await {
            let path = staged.path().display().to_string();
            if let Err(cleanup) = staged.discard() {
                warn!(%path, error = %cleanup, "failed to remove staged manifest");
            }
            return Err(ApplyError::new(stage, err));
        }

        // The canonical manifest only changes once the runtime has accepted the new one.
        let stage = ApplyStage::Applying;
        sink.info(stage, format!("starting {} services", services.len()));
        if let Err(err) = self.runtime.up(staged.path()).await {
            let path = staged.path().display().to_string();
            if let Err(cleanup) = staged.discard() {
                warn!(%path, error = %cleanup, "failed to remove staged manifest");
            }
            return Err(ApplyError::new(stage, err));
        }
        staged.promote().map_err(|err| ApplyError::new(stage, err))?;

        let stage = ApplyStage::HealthGating;
        let containers: Vec<String> = services.iter().map(|service| service.name.clone()).collect();
        sink.info(stage, format!("waiting for {} containers", containers.len()));
        let health = health::wait_healthy(
            self.runtime.as_ref(),
            &containers,
            Duration::from_secs(cfg.health.timeout_secs),
            Duration::from_millis(cfg.health.poll_interval_ms),
        )
        .await;
        telemetry::record_health_gate(match &health {
            Ok(()) => "success",
            Err(HealthCheckError::Failed { .. }) => "failed",
            Err(HealthCheckError::Timeout { .. }) => "timeout",
        });
        health.map_err(|err| ApplyError::new(stage, err))?;
        sink.info(stage, "all containers healthy");

        let stage = ApplyStage::ReloadingProxy;
        self.reload_proxy(&artifacts, sink)
            .await
            .map_err(|err| ApplyError::new(stage, err))?;

        let stage = ApplyStage::Persisting;
        let applied = AppliedIntent {
            intent,
            applied_at: Utc::now(),
            digests: resolver::digest_map(&services),
        };
        if let Err(err) = self.store.save_applied(&applied) {
            error!(
                error = %err,
                "services are running but the applied-intent record could not be written"
            );
            return Err(ApplyError::new(stage, err));
        }
        sink.info(stage, format!("recorded applied intent at {}", applied.applied_at.to_rfc3339()));

        Ok(ApplyOutcome {
            services: services.len(),
            digests: applied.digests,
            applied_at: applied.applied_at,
        })
    }

    async fn dns_gate(
        &self,
        services: &[ResolvedService],
        sink: &ProgressSink,
    ) -> Result<(), DnsError> {
        let stage = ApplyStage::DnsGating;
        if !self.config.dns.enabled {
            telemetry::record_dns_gate("skipped");
            sink.warn(stage, "dns gate disabled");
            return Ok(());
        }
        let domains: Vec<String> = services
            .iter()
            .filter_map(|service| service.domain.clone())
            .collect();
        sink.info(stage, format!("waiting for {} domains to resolve", domains.len()));
        let result = dns::wait_resolvable(
            self.dns.as_ref(),
            &domains,
            Duration::from_secs(self.config.dns.timeout_secs),
            Duration::from_millis(self.config.dns.poll_interval_ms),
        )
        .await;
        telemetry::record_dns_gate(if result.is_ok() { "success" } else { "timeout" });
        result
    }

    async fn reload_proxy(
        &self,
        artifacts: &Artifacts,
        sink: &ProgressSink,
    ) -> Result<(), ApplyErrorKind> {
        let stage = ApplyStage::ReloadingProxy;
        let previous = match self.store.read_routing() {
            Ok(previous) => previous,
            Err(err) => {
                sink.warn(stage, format!("previous routing config unreadable: {err}"));
                None
            }
        };
        let diff = generate::diff_routing(previous.as_deref(), &artifacts.caddy);
        match &diff.previous {
            Some(before) if diff.unchanged() => {
                sink.info(stage, format!("routing config {before} (unchanged)"))
            }
            Some(before) => sink.info(stage, format!("routing config {before} -> {}", diff.current)),
            None => sink.info(stage, format!("routing config {}", diff.current)),
        }
        for domain in &diff.added {
            sink.info(stage, format!("+ {domain}"));
        }
        for domain in &diff.removed {
            sink.info(stage, format!("- {domain}"));
        }

        let loaded = self.proxy.load(&artifacts.caddy).await;
        telemetry::record_proxy_reload(if loaded.is_ok() { "success" } else { "rejected" });
        loaded?;
        self.store.write_routing(&artifacts.caddy)?;
        sink.info(stage, "proxy reloaded");
        Ok(())
    }
}

fn report_resolution(services: &[ResolvedService], sink: &ProgressSink) {
    let stage = ApplyStage::Resolving;
    for service in services.iter().filter(|service| service.kind == ServiceKind::App) {
        match &service.image_digest {
            Some(pinned) if pinned != &service.image => {
                sink.info(stage, format!("{}: {} -> {pinned}", service.name, service.image))
            }
            _ => sink.info(stage, format!("{}: {}", service.name, service.deploy_image())),
        }
    }
}

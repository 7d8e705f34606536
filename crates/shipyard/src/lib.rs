pub mod app_state;
pub mod apply;
pub mod config;
pub mod dns;
pub mod error;
pub mod generate;
pub mod health;
pub mod http;
pub mod image;
pub mod progress;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod store;
pub mod telemetry;
pub mod validation;
pub mod version;

#[cfg(test)]
mod test_support;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{
    env, fs,
    future::Future,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info};

use crate::app_state::AppState;
use crate::apply::Reconciler;
use crate::config::AppConfig;
use crate::dns::SystemResolver;
use crate::proxy::CaddyAdmin;
use crate::registry::RegistryClient;
use crate::runtime::compose::ComposeCli;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandMode {
    Serve,
    /// Check an intent file and exit.
    Validate(PathBuf),
}

pub fn parse_command() -> Result<CommandMode> {
    parse_args(env::args().skip(1))
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CommandMode> {
    let mut args = args.into_iter();
    let Some(first) = args.next() else {
        return Ok(CommandMode::Serve);
    };

    match first.as_str() {
        "serve" => Ok(CommandMode::Serve),
        "validate" => match args.next() {
            Some(path) => Ok(CommandMode::Validate(PathBuf::from(path))),
            None => anyhow::bail!("validate requires an intent file path"),
        },
        "--help" | "-h" => {
            println!(
                "Usage: shipyard [serve]|[validate <intent.json>]\n\
                 Run without arguments to start the server."
            );
            std::process::exit(0);
        }
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

pub async fn run(mode: CommandMode) -> Result<()> {
    match mode {
        CommandMode::Serve => run_with_shutdown(shutdown_signal()).await,
        CommandMode::Validate(path) => validate_file(&path),
    }
}

/// Serves the HTTP surface until `shutdown` resolves.
pub async fn run_with_shutdown<S>(shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = telemetry::init_metrics_recorder();
    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    info!(
        data_dir = %app_config.data_dir,
        project = %app_config.compose.project,
        dns_gate = app_config.dns.enabled,
        "configuration loaded"
    );

    let state = build_state(app_config, metrics_handle)?;
    let app = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind {api_addr}"))?;
    info!(%api_addr, "shipyard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| anyhow::anyhow!("shipyard server failed: {err}"))?;
    Ok(())
}

/// Wires the production collaborators around `app_config`.
pub fn build_state(app_config: AppConfig, metrics_handle: PrometheusHandle) -> Result<AppState> {
    let registry = RegistryClient::new(&app_config.registry).context("registry client")?;
    let proxy = CaddyAdmin::new(&app_config.proxy).context("proxy admin client")?;
    let runtime = ComposeCli::new(&app_config.compose);
    let reconciler = Reconciler::new(
        Arc::new(app_config),
        Arc::new(runtime),
        Arc::new(proxy),
        Arc::new(SystemResolver),
        registry,
    );
    reconciler
        .store()
        .ensure_dir()
        .context("failed to prepare data directory")?;
    Ok(AppState::new(reconciler, metrics_handle))
}

/// Runs intent validation on a file and prints every problem found.
pub fn validate_file(path: &Path) -> Result<()> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    match validation::parse(&raw) {
        Ok(intent) => {
            println!(
                "{}: valid intent with {} apps",
                path.display(),
                intent.apps.len()
            );
            Ok(())
        }
        Err(errors) => {
            for err in errors.errors() {
                eprintln!("- {err}");
            }
            anyhow::bail!(
                "{} is not a valid intent ({} problems)",
                path.display(),
                errors.errors().len()
            )
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}

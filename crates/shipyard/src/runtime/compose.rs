use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ComposeError, ComposeRuntime, ContainerState};
use crate::config::ComposeConfig;

const INSPECT_FORMAT: &str =
    "{{.State.Status}} {{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}";

#[derive(Debug)]
struct CommandOutput {
    stdout: String,
    stderr: String,
    status: ExitStatus,
}

/// Drives the `<binary> compose` CLI as an external process.
#[derive(Debug, Clone)]
pub struct ComposeCli {
    binary: String,
    project: String,
}

impl ComposeCli {
    pub fn new(cfg: &ComposeConfig) -> Self {
        Self {
            binary: cfg.binary.clone(),
            project: cfg.project.clone(),
        }
    }

    fn compose_args(&self, manifest: &Path, action: &[&str]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            manifest.display().to_string(),
            "-p".to_string(),
            self.project.clone(),
        ];
        args.extend(action.iter().map(|arg| arg.to_string()));
        args
    }

    async fn run_checked(&self, args: Vec<String>) -> Result<CommandOutput, ComposeError> {
        let rendered = format!("{} {}", self.binary, args.join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        let output = run_capture(cmd, &rendered).await?;
        if !output.status.success() {
            return Err(ComposeError::CommandFailed {
                command: rendered,
                status: output.status.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        debug!(command = %rendered, "command succeeded");
        Ok(output)
    }
}

#[async_trait]
impl ComposeRuntime for ComposeCli {
    async fn validate(&self, manifest: &Path) -> Result<(), ComposeError> {
        self.run_checked(self.compose_args(manifest, &["config", "--quiet"]))
            .await
            .map(|_| ())
    }

    async fn up(&self, manifest: &Path) -> Result<(), ComposeError> {
        self.run_checked(self.compose_args(
            manifest,
            &["up", "--detach", "--wait", "--remove-orphans"],
        ))
        .await
        .map(|_| ())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, ComposeError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            INSPECT_FORMAT.to_string(),
            container.to_string(),
        ];
        match self.run_checked(args).await {
            Ok(output) => parse_inspect_output(container, &output.stdout),
            Err(ComposeError::CommandFailed { stderr, .. }) if is_not_found(&stderr) => {
                Err(ComposeError::NotFound(container.to_string()))
            }
            Err(err) => Err(err),
        }
    }
}

async fn run_capture(mut cmd: Command, rendered: &str) -> Result<CommandOutput, ComposeError> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ComposeError::Spawn {
            command: rendered.to_string(),
            source,
        })?;
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        status: output.status,
    })
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such object") || lower.contains("no such container")
}

pub(crate) fn parse_inspect_output(
    container: &str,
    stdout: &str,
) -> Result<ContainerState, ComposeError> {
    let mut parts = stdout.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(status), Some(health), None) => Ok(ContainerState::new(
            status,
            (health != "none").then_some(health),
        )),
        _ => Err(ComposeError::Parse {
            container: container.to_string(),
            output: stdout.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(binary: &str) -> ComposeCli {
        ComposeCli {
            binary: binary.into(),
            project: "shipyard".into(),
        }
    }

    #[test]
    fn compose_args_pin_file_and_project() {
        let args = cli("docker").compose_args(Path::new("/data/docker-compose.yml"), &["config", "--quiet"]);
        assert_eq!(
            args,
            [
                "compose",
                "-f",
                "/data/docker-compose.yml",
                "-p",
                "shipyard",
                "config",
                "--quiet"
            ]
        );
    }

    #[test]
    fn parse_inspect_output_handles_health_states() {
        let healthy = parse_inspect_output("api", "running healthy\n").expect("state");
        assert_eq!(healthy, ContainerState::new("running", Some("healthy")));

        let plain = parse_inspect_output("api", "running none").expect("state");
        assert!(plain.health.is_none());
        assert_eq!(plain.health_label(), "none");

        let err = parse_inspect_output("api", "").unwrap_err();
        assert!(matches!(err, ComposeError::Parse { .. }), "{err}");
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found("Error: No such object: api"));
        assert!(is_not_found("Error response from daemon: No such container: api"));
        assert!(!is_not_found("permission denied"));
    }

    #[tokio::test]
    async fn successful_commands_pass() {
        // `true` ignores its arguments and exits 0.
        cli("true")
            .validate(Path::new("/tmp/manifest.yml"))
            .await
            .expect("validate");
    }

    #[tokio::test]
    async fn failing_commands_report_status_and_command() {
        let err = cli("false")
            .up(Path::new("/tmp/manifest.yml"))
            .await
            .unwrap_err();
        match err {
            ComposeError::CommandFailed { command, .. } => {
                assert!(command.starts_with("false compose -f /tmp/manifest.yml"), "{command}");
                assert!(command.ends_with("up --detach --wait --remove-orphans"), "{command}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = cli("definitely-not-a-command-12345")
            .inspect("api")
            .await
            .unwrap_err();
        assert!(matches!(err, ComposeError::Spawn { .. }), "{err}");
    }
}

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::engine::LaunchSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited { code: Option<i32> },
    NotFound,
    /// created, paused, restarting, ...
    Other,
}

/// Container operations the orchestrator needs. Implemented by [`DockerCli`]
/// and by in-memory fakes in tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates and starts a detached container.
    async fn run(&self, spec: &LaunchSpec) -> anyhow::Result<()>;

    async fn status(&self, name: &str) -> anyhow::Result<ContainerStatus>;

    /// Last `tail` lines of stdout and stderr.
    async fn logs(&self, name: &str, tail: usize) -> anyhow::Result<String>;

    async fn stop(&self, name: &str, grace: Duration) -> anyhow::Result<()>;

    /// Force-removes the container. Succeeds if it does not exist.
    async fn remove(&self, name: &str) -> anyhow::Result<()>;
}

/// Drives the `docker` CLI.
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn exec(&self, args: &[String]) -> anyhow::Result<std::process::Output> {
        let output = Command::new(&self.bin).args(args).output().await?;
        Ok(output)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

fn stderr_text(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

pub(crate) fn parse_inspect(stdout: &str) -> ContainerStatus {
    let line = stdout.trim();
    let (state, code) = line.split_once(' ').unwrap_or((line, ""));
    match state {
        "running" => ContainerStatus::Running,
        "exited" | "dead" => ContainerStatus::Exited {
            code: code.trim().parse().ok(),
        },
        _ => ContainerStatus::Other,
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run(&self, spec: &LaunchSpec) -> anyhow::Result<()> {
        tracing::info!(
            container = %spec.container_name,
            image = %spec.image,
            port = spec.host_port,
            "launching engine container"
        );
        // A leftover container with the same name blocks `docker run`.
        self.remove(&spec.container_name).await?;
        let output = self.exec(&spec.docker_args()).await?;
        if !output.status.success() {
            anyhow::bail!("docker run failed: {}", stderr_text(&output));
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> anyhow::Result<ContainerStatus> {
        let args = [
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Status}} {{.State.ExitCode}}".to_string(),
            name.to_string(),
        ];
        let output = self.exec(&args).await?;
        if !output.status.success() {
            let err = stderr_text(&output);
            if err.to_ascii_lowercase().contains("no such") {
                return Ok(ContainerStatus::NotFound);
            }
            anyhow::bail!("docker inspect failed: {err}");
        }
        Ok(parse_inspect(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn logs(&self, name: &str, tail: usize) -> anyhow::Result<String> {
        let args = [
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            name.to_string(),
        ];
        let output = self.exec(&args).await?;
        if !output.status.success() {
            anyhow::bail!("docker logs failed: {}", stderr_text(&output));
        }
        // Engines log mostly to stderr; docker keeps the streams separate.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn stop(&self, name: &str, grace: Duration) -> anyhow::Result<()> {
        tracing::info!(%name, "stopping docker container");
        let args = [
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            name.to_string(),
        ];
        let output = self.exec(&args).await?;
        if !output.status.success() {
            let err = stderr_text(&output);
            if !err.to_ascii_lowercase().contains("no such container") {
                anyhow::bail!("docker stop failed: {err}");
            }
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let args = ["rm".to_string(), "-f".to_string(), name.to_string()];
        let output = self.exec(&args).await?;
        if !output.status.success() {
            let err = stderr_text(&output);
            if !err.to_ascii_lowercase().contains("no such container") {
                anyhow::bail!("docker rm failed: {err}");
            }
        }
        Ok(())
    }
}

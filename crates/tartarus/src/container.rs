//! Container runtime used to compile and run untrusted code.
//!
//! Every container gets the workspace bind-mounted at `/workspace` as its
//! only writable host path, no network, a read-only root filesystem with a
//! small `/tmp` tmpfs, all capabilities dropped, and explicit memory, CPU
//! and process-count ceilings.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::SandboxError;

/// Mount point of the workspace inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Exit codes `docker run` uses for its own failures.
const DOCKER_DAEMON_ERROR: i32 = 125;
const DOCKER_CANNOT_INVOKE: i32 = 126;

/// Resolved settings for one container run.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    /// Host directory mounted read-write at [`WORKSPACE_MOUNT`]
    pub workspace: PathBuf,
    pub command: Vec<String>,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    pub timeout: Duration,
}

/// How the container ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Exited(i32),
    /// Killed by the kernel OOM killer under the memory ceiling
    OomKilled,
    /// Wall-clock timeout hit; the container was killed
    TimedOut,
}

/// Output captured from a container run.
#[derive(Debug, Clone)]
pub struct ContainerRun {
    pub status: ContainerStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ContainerRun {
    pub fn success(&self) -> bool {
        self.status == ContainerStatus::Exited(0)
    }
}

/// Runtime able to execute a [`ContainerSpec`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure the image is available locally. Best-effort.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;

    /// Run the container to completion or timeout.
    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerRun, SandboxError>;
}

/// [`ContainerRuntime`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    api_version: Option<String>,
}

impl DockerCli {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            api_version: config.docker_api_version.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(ref ver) = self.api_version {
            cmd.env("DOCKER_API_VERSION", ver);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Best-effort `docker <args>` whose output is not needed.
    async fn quiet(&self, args: &[&str]) -> bool {
        let status = self
            .command()
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(status, Ok(s) if s.success())
    }

    async fn oom_killed(&self, name: &str) -> bool {
        let output = self
            .command()
            .args(["inspect", "--format", "{{.State.OOMKilled}}", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim() == "true",
            _ => false,
        }
    }
}

/// Build the `docker run` argument list for a spec.
pub fn docker_run_args(spec: &ContainerSpec, name: &str) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "--name".into(), name.to_string()];

    // ── Resource constraints ──────────────────────────────
    args.push(format!("--memory={}m", spec.memory_mb));
    // Same as --memory so swap cannot extend the ceiling
    args.push(format!("--memory-swap={}m", spec.memory_mb));
    args.push(format!("--cpus={}", spec.cpus));
    args.push(format!("--pids-limit={}", spec.pids_limit));

    // ── Isolation ─────────────────────────────────────────
    args.push("--network=none".into());
    args.push("--cap-drop=ALL".into());
    args.push("--security-opt=no-new-privileges".into());
    args.push("--read-only".into());
    args.push("--tmpfs=/tmp:rw,noexec,nosuid,size=256m".into());

    // ── Volume: workspace → /workspace ────────────────────
    args.push("-v".into());
    args.push(format!("{}:{}:rw", spec.workspace.display(), WORKSPACE_MOUNT));
    args.push("-w".into());
    args.push(WORKSPACE_MOUNT.into());

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());

    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.quiet(&["image", "inspect", image]).await {
            tracing::debug!(image = %image, "Docker image already present");
            return Ok(());
        }

        tracing::info!(image = %image, "Pulling Docker image");
        let pull = self
            .command()
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("Failed to run docker pull: {}", e)))?;

        if pull.status.success() {
            tracing::info!(image = %image, "Docker image pulled successfully");
        } else {
            tracing::warn!(
                image = %image,
                stderr = %String::from_utf8_lossy(&pull.stderr),
                "docker pull failed, will try to use cached image"
            );
        }

        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerRun, SandboxError> {
        let name = format!("tartarus-{}", Uuid::new_v4());
        let args = docker_run_args(spec, &name);

        tracing::debug!(
            image = %spec.image,
            container = %name,
            cmd = ?spec.command,
            timeout_ms = spec.timeout.as_millis() as u64,
            "Spawning sandbox container"
        );

        let start = Instant::now();
        let child = self
            .command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Runtime(format!(
                    "Failed to spawn docker process, is the Docker socket mounted? {}",
                    e
                ))
            })?;

        let waited = tokio::time::timeout(spec.timeout, child.wait_with_output()).await;
        let elapsed = start.elapsed();

        let run = match waited {
            Ok(Ok(output)) => {
                let code = output.status.code().unwrap_or(-1);
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();

                if code == DOCKER_DAEMON_ERROR || code == DOCKER_CANNOT_INVOKE {
                    self.quiet(&["rm", "-f", &name]).await;
                    return Err(SandboxError::Runtime(format!(
                        "docker run failed with code {}: {}",
                        code,
                        stderr.trim()
                    )));
                }

                // The driver shell may survive an OOM kill of its child, so
                // the flag is checked whatever the exit code.
                let status = if self.oom_killed(&name).await {
                    ContainerStatus::OomKilled
                } else {
                    ContainerStatus::Exited(code)
                };

                ContainerRun {
                    status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr,
                    elapsed,
                }
            }
            Ok(Err(e)) => {
                self.quiet(&["rm", "-f", &name]).await;
                return Err(SandboxError::Runtime(format!(
                    "Docker command execution failed: {}",
                    e
                )));
            }
            Err(_) => {
                // The CLI client is gone with the dropped future; the
                // container itself has to be killed by name.
                self.quiet(&["kill", &name]).await;
                ContainerRun {
                    status: ContainerStatus::TimedOut,
                    stdout: String::new(),
                    stderr: String::new(),
                    elapsed,
                }
            }
        };

        if !self.quiet(&["rm", "-f", &name]).await {
            tracing::warn!(container = %name, "Failed to remove sandbox container");
        }

        Ok(run)
    }
}

//! Build step for compiled languages.
//!
//! The compile command runs in its own network-less container over the
//! same workspace, so the produced binary is left next to the source for the
//! batch run.

use std::sync::Arc;
use std::time::Duration;

use crate::config::SandboxConfig;
use crate::container::{ContainerRuntime, ContainerSpec, ContainerStatus};
use crate::error::SandboxError;
use crate::languages::LanguageProfile;
use crate::workspace::Workspace;

/// Result of the build step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileResult {
    /// Nothing to build, or the build succeeded
    Ready,
    /// Build failed; carries the diagnostic text
    Failed(String),
}

/// Compiler handles the build step of a submission.
pub struct Compiler {
    config: SandboxConfig,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Compiler {
    pub fn new(config: SandboxConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { config, runtime }
    }

    /// Build the source already written to the workspace.
    pub async fn compile(
        &self,
        profile: &LanguageProfile,
        workspace: &Workspace,
    ) -> Result<CompileResult, SandboxError> {
        let Some(compile_cmd) = profile.compile_command.as_deref() else {
            return Ok(CompileResult::Ready);
        };

        let spec = ContainerSpec {
            image: profile.image.clone(),
            workspace: workspace.dir().to_path_buf(),
            command: vec!["sh".into(), "-c".into(), compile_cmd.to_string()],
            memory_mb: self.config.compile_memory_mb,
            cpus: self.config.compile_cpus,
            pids_limit: self.config.pids_limit,
            timeout: Duration::from_millis(self.config.compile_timeout_ms),
        };

        let run = self.runtime.run(&spec).await?;

        tracing::debug!(
            workspace_id = %workspace.id(),
            language = %profile.language,
            status = ?run.status,
            elapsed_ms = run.elapsed.as_millis() as u64,
            "Compilation finished"
        );

        let result = match run.status {
            ContainerStatus::Exited(0) => CompileResult::Ready,
            ContainerStatus::Exited(code) => {
                let diagnostics = if run.stderr.trim().is_empty() {
                    run.stdout
                } else {
                    run.stderr
                };
                CompileResult::Failed(if diagnostics.trim().is_empty() {
                    format!("Compiler exited with code {}", code)
                } else {
                    diagnostics
                })
            }
            ContainerStatus::OomKilled => CompileResult::Failed(format!(
                "Compiler exceeded {} MB memory limit",
                self.config.compile_memory_mb
            )),
            ContainerStatus::TimedOut => CompileResult::Failed(format!(
                "Compilation timed out after {} ms",
                self.config.compile_timeout_ms
            )),
        };

        Ok(result)
    }
}

//! Sandbox orchestrator: one submission in, one [`EvaluationOutcome`] out.

use std::sync::Arc;

use agon_common::{Constraints, Language, Testcase};

use crate::batch::BatchExecutor;
use crate::compiler::{CompileResult, Compiler};
use crate::config::SandboxConfig;
use crate::container::ContainerRuntime;
use crate::error::SandboxError;
use crate::languages::LanguageRegistry;
use crate::outcome::EvaluationOutcome;
use crate::workspace::Workspace;

/// Everything needed to judge one submission.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub code: String,
    pub language: Language,
    pub testcases: Vec<Testcase>,
    pub constraints: Constraints,
    /// `false` stops at the first failing case
    pub run_all_testcases: bool,
}

/// Composes the workspace manager, language registry, compiler and batch
/// executor.
pub struct Sandbox {
    config: SandboxConfig,
    registry: LanguageRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    compiler: Compiler,
    executor: BatchExecutor,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            registry: LanguageRegistry::new(&config.images),
            compiler: Compiler::new(config.clone(), runtime.clone()),
            executor: BatchExecutor::new(config.clone(), runtime.clone()),
            config,
            runtime,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// Pull every language image ahead of the first job. Best-effort.
    pub async fn prepare_images(&self) {
        for image in self.registry.images() {
            if let Err(e) = self.runtime.ensure_image(&image).await {
                tracing::warn!(image = %image, "Failed to prepare image: {}", e);
            }
        }
    }

    /// Judge a submission.
    ///
    /// Never fails: verdicts are returned as-is, and plumbing errors come back
    /// as an outcome flagged with `sandbox_fault`.
    pub async fn evaluate(&self, req: &EvaluationRequest) -> EvaluationOutcome {
        let total = req.testcases.len();

        let workspace = match Workspace::create(&self.config.workspace_root) {
            Ok(ws) => ws,
            Err(e) => {
                tracing::error!("Failed to create workspace: {}", e);
                return EvaluationOutcome::sandbox_fault(total, format!("workspace: {}", e));
            }
        };
        let workspace_id = workspace.id();

        let result = self.evaluate_in(&workspace, req).await;
        workspace.release().await;

        match result {
            Ok(outcome) => {
                tracing::debug!(
                    workspace_id = %workspace_id,
                    verdict = %outcome.verdict,
                    passed = outcome.passed,
                    total = outcome.total,
                    time_ms = outcome.time_taken_ms,
                    "Evaluation finished"
                );
                outcome
            }
            Err(e) => {
                tracing::error!(workspace_id = %workspace_id, "Sandbox failure: {}", e);
                EvaluationOutcome::sandbox_fault(total, e.to_string())
            }
        }
    }

    async fn evaluate_in(
        &self,
        workspace: &Workspace,
        req: &EvaluationRequest,
    ) -> Result<EvaluationOutcome, SandboxError> {
        let profile = self.registry.profile(req.language)?;

        // Nothing to score: no build, and the outcome stays AC 0/0.
        if req.testcases.is_empty() {
            return Ok(EvaluationOutcome::from_results(Vec::new(), 0, 0));
        }

        if let Err(e) = self.runtime.ensure_image(&profile.image).await {
            tracing::warn!(image = %profile.image, "Image check failed, trying cached image: {}", e);
        }

        workspace
            .write(&profile.source_file, req.code.as_bytes())
            .await?;

        if let CompileResult::Failed(diagnostics) = self.compiler.compile(profile, workspace).await? {
            return Ok(EvaluationOutcome::compile_error(req.testcases.len(), &diagnostics));
        }

        self.executor
            .execute(
                profile,
                workspace,
                &req.testcases,
                &req.constraints,
                req.run_all_testcases,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use agon_common::Verdict;
    use mockall::predicate::always;

    use super::*;
    use crate::batch::{output_file, status_file};
    use crate::container::{ContainerRun, ContainerSpec, ContainerStatus, MockContainerRuntime};

    fn exited(code: i32) -> ContainerRun {
        ContainerRun {
            status: ContainerStatus::Exited(code),
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::from_millis(30),
        }
    }

    fn record(dir: &Path, index: usize, code: i32, stdout: &str) {
        std::fs::write(dir.join(status_file(index)), format!("{}\n", code)).unwrap();
        std::fs::write(dir.join(output_file(index)), stdout).unwrap();
    }

    fn is_batch(spec: &ContainerSpec) -> bool {
        spec.command == ["sh", "run.sh"]
    }

    fn sandbox(runtime: MockContainerRuntime) -> (Sandbox, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            workspace_root: root.path().to_path_buf(),
            ..Default::default()
        };
        (Sandbox::new(config, Arc::new(runtime)), root)
    }

    fn request(language: Language, cases: &[(&str, &str)], run_all: bool) -> EvaluationRequest {
        EvaluationRequest {
            code: "print(3)".to_string(),
            language,
            testcases: cases.iter().map(|(i, o)| Testcase::new(*i, *o)).collect(),
            constraints: Constraints {
                time_limit_ms: 1000,
                ..Default::default()
            },
            run_all_testcases: run_all,
        }
    }

    fn workspaces_left(root: &Path) -> usize {
        std::fs::read_dir(root).unwrap().count()
    }

    #[tokio::test]
    async fn test_simple_accept() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ensure_image().with(always()).returning(|_| Ok(()));
        runtime
            .expect_run()
            .withf(|spec| is_batch(spec) && spec.memory_mb == 256)
            .times(1)
            .returning(|spec| {
                assert!(spec.workspace.join("solution.py").exists());
                record(&spec.workspace, 0, 0, "3\n");
                Ok(exited(0))
            });

        let (sandbox, root) = sandbox(runtime);
        let outcome = sandbox
            .evaluate(&request(Language::Python, &[("1 2", "3")], false))
            .await;

        assert_eq!(outcome.verdict, Verdict::Accepted);
        assert_eq!((outcome.passed, outcome.total), (1, 1));
        assert_eq!(workspaces_left(root.path()), 0);
    }

    #[tokio::test]
    async fn test_compile_failure_runs_nothing() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ensure_image().returning(|_| Ok(()));
        runtime
            .expect_run()
            .withf(|spec| !is_batch(spec))
            .times(1)
            .returning(|_| {
                Ok(ContainerRun {
                    stderr: "solution.cpp:1:1: error: expected unqualified-id".into(),
                    ..exited(1)
                })
            });
        runtime.expect_run().withf(|spec| is_batch(spec)).never();

        let (sandbox, root) = sandbox(runtime);
        let outcome = sandbox
            .evaluate(&request(Language::Cpp, &[("1", "1"), ("2", "2")], false))
            .await;

        assert_eq!(outcome.verdict, Verdict::CompileError);
        assert_eq!((outcome.passed, outcome.total), (0, 2));
        assert!(outcome.results.is_empty());
        assert!(outcome.error_message.unwrap().contains("expected unqualified-id"));
        assert_eq!(workspaces_left(root.path()), 0);
    }

    #[tokio::test]
    async fn test_timeout_inherited_by_unreported_cases() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ensure_image().returning(|_| Ok(()));
        runtime.expect_run().returning(|_| {
            Ok(ContainerRun {
                status: ContainerStatus::TimedOut,
                ..exited(0)
            })
        });

        let (sandbox, _root) = sandbox(runtime);
        let outcome = sandbox
            .evaluate(&request(Language::Python, &[("1", "1"), ("2", "2")], false))
            .await;

        assert_eq!(outcome.verdict, Verdict::TimeLimitExceeded);
        assert_eq!(outcome.passed, 0);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].verdict, Verdict::TimeLimitExceeded);
    }

    #[tokio::test]
    async fn test_fail_fast_scores_up_to_first_failure() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ensure_image().returning(|_| Ok(()));
        runtime
            .expect_run()
            .withf(|spec| {
                let script = std::fs::read_to_string(spec.workspace.join("run.sh")).unwrap();
                script.contains("fail_fast=1")
            })
            .returning(|spec| {
                // A wrong answer exits 0, so the driver records every case.
                record(&spec.workspace, 0, 0, "1");
                record(&spec.workspace, 1, 0, "wrong");
                record(&spec.workspace, 2, 0, "3");
                Ok(exited(0))
            });

        let (sandbox, _root) = sandbox(runtime);
        let outcome = sandbox
            .evaluate(&request(Language::Python, &[("1", "1"), ("2", "2"), ("3", "3")], false))
            .await;

        assert_eq!(outcome.verdict, Verdict::WrongAnswer);
        assert_eq!(outcome.passed, 1);
        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[1].index, 1);
        assert_eq!(outcome.failed_output.as_deref(), Some("wrong"));
    }

    #[tokio::test]
    async fn test_empty_testcases_skip_the_build() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ensure_image().never();
        runtime.expect_run().never();

        let (sandbox, root) = sandbox(runtime);
        let mut req = request(Language::Cpp, &[], false);
        req.code = "int main() { this does not compile }".to_string();
        let outcome = sandbox.evaluate(&req).await;

        assert_eq!(outcome.verdict, Verdict::Accepted);
        assert_eq!((outcome.passed, outcome.total), (0, 0));
        assert!(outcome.error_message.is_none());
        assert_eq!(workspaces_left(root.path()), 0);
    }

    #[tokio::test]
    async fn test_kill_after_grace_is_time_limit() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ensure_image().returning(|_| Ok(()));
        runtime.expect_run().returning(|spec| {
            record(&spec.workspace, 0, 137, "");
            Ok(exited(0))
        });

        let (sandbox, _root) = sandbox(runtime);
        let outcome = sandbox
            .evaluate(&request(Language::Python, &[("1", "1")], false))
            .await;

        assert_eq!(outcome.verdict, Verdict::TimeLimitExceeded);
        assert_eq!(outcome.error_message.as_deref(), Some("Time limit exceeded"));
    }

    #[tokio::test]
    async fn test_output_cap_exit_is_runtime_error() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ensure_image().returning(|_| Ok(()));
        runtime.expect_run().returning(|spec| {
            record(&spec.workspace, 0, 153, "yyyy");
            Ok(exited(0))
        });

        let (sandbox, _root) = sandbox(runtime);
        let outcome = sandbox
            .evaluate(&request(Language::Python, &[("1", "1")], false))
            .await;

        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert_eq!(outcome.error_message.as_deref(), Some("Output limit exceeded"));
    }

    #[tokio::test]
    async fn test_run_all_reports_every_case() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ensure_image().returning(|_| Ok(()));
        runtime.expect_run().returning(|spec| {
            record(&spec.workspace, 0, 1, "");
            std::fs::write(spec.workspace.join("error_000.txt"), "Traceback: boom").unwrap();
            record(&spec.workspace, 1, 124, "");
            record(&spec.workspace, 2, 0, "3");
            Ok(exited(0))
        });

        let (sandbox, _root) = sandbox(runtime);
        let outcome = sandbox
            .evaluate(&request(Language::Python, &[("1", "1"), ("2", "2"), ("3", "3")], true))
            .await;

        let verdicts: Vec<Verdict> = outcome.results.iter().map(|r| r.verdict).collect();
        assert_eq!(
            verdicts,
            vec![Verdict::RuntimeError, Verdict::TimeLimitExceeded, Verdict::Accepted]
        );
        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert_eq!(outcome.error_message.as_deref(), Some("Traceback: boom"));
        assert_eq!(outcome.passed, 1);
    }

    #[tokio::test]
    async fn test_oom_kill_is_memory_limit() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ensure_image().returning(|_| Ok(()));
        runtime.expect_run().returning(|spec| {
            record(&spec.workspace, 0, 137, "");
            Ok(ContainerRun {
                status: ContainerStatus::OomKilled,
                ..exited(0)
            })
        });

        let (sandbox, _root) = sandbox(runtime);
        let outcome = sandbox
            .evaluate(&request(Language::Python, &[("1", "1")], false))
            .await;

        assert_eq!(outcome.verdict, Verdict::MemoryLimitExceeded);
    }

    #[tokio::test]
    async fn test_runtime_failure_is_flagged_fault() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ensure_image().returning(|_| Ok(()));
        runtime
            .expect_run()
            .returning(|_| Err(SandboxError::Runtime("docker daemon unreachable".into())));

        let (sandbox, root) = sandbox(runtime);
        let outcome = sandbox
            .evaluate(&request(Language::Python, &[("1", "1")], false))
            .await;

        assert!(outcome.is_sandbox_fault());
        assert_ne!(outcome.verdict, Verdict::Accepted);
        assert_eq!(workspaces_left(root.path()), 0);
    }

    #[tokio::test]
    async fn test_image_check_failure_is_not_fatal() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_ensure_image()
            .returning(|_| Err(SandboxError::Runtime("registry down".into())));
        runtime.expect_run().returning(|spec| {
            record(&spec.workspace, 0, 0, "1");
            Ok(exited(0))
        });

        let (sandbox, _root) = sandbox(runtime);
        let outcome = sandbox
            .evaluate(&request(Language::Python, &[("1", "1")], false))
            .await;

        assert!(outcome.is_accepted());
    }
}

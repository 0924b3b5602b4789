//! Batch execution of all test cases in one sandbox invocation.
//!
//! Every case input is written to `input_NNN.txt`. A generated `run.sh`
//! driver walks the cases in index order, runs the program under a
//! per-case `timeout`, and records `output_NNN.txt`, `error_NNN.txt` and the
//! exit code in `status_NNN.txt`. Each case runs in a subshell whose file
//! size limit sits just above the output cap, so a flooding program is
//! stopped by the kernel instead of filling the disk.
//!
//! In fail-fast mode the driver stops after the first non-zero exit code.
//! Expected outputs never enter the sandbox, so a wrong answer with exit
//! code 0 is only detected here: the driver runs on, and scoring stops at
//! that case.

use std::sync::Arc;
use std::time::Duration;

use agon_common::{Constraints, Testcase, Verdict};

use crate::comparator;
use crate::config::SandboxConfig;
use crate::container::{ContainerRuntime, ContainerSpec, ContainerStatus};
use crate::error::SandboxError;
use crate::languages::LanguageProfile;
use crate::outcome::{EvaluationOutcome, SingleTestcaseResult, truncate};
use crate::workspace::Workspace;

pub const DRIVER_SCRIPT: &str = "run.sh";

/// Exit code of `timeout` when the time limit fired.
const TIMEOUT_EXIT: i32 = 124;
/// 128 + SIGKILL: `timeout` escalated after the grace second, or the
/// kernel OOM killer.
const SIGKILL_EXIT: i32 = 137;
/// 128 + SIGXFSZ
const FILE_SIZE_EXIT: i32 = 153;

/// `ulimit -f` value for an output cap. POSIX `sh` counts 512-byte blocks;
/// the limit lands strictly above the cap so a capped write is detectable.
pub fn file_size_blocks(output_limit_bytes: u64) -> u64 {
    output_limit_bytes / 512 + 1
}

pub fn input_file(index: usize) -> String {
    format!("input_{:03}.txt", index)
}

pub fn output_file(index: usize) -> String {
    format!("output_{:03}.txt", index)
}

pub fn error_file(index: usize) -> String {
    format!("error_{:03}.txt", index)
}

pub fn status_file(index: usize) -> String {
    format!("status_{:03}.txt", index)
}

/// Render the driver script for `count` cases.
pub fn driver_script(
    run_command: &str,
    count: usize,
    time_limit_ms: u64,
    output_limit_bytes: u64,
    fail_fast: bool,
) -> String {
    // Seconds with millisecond precision, as accepted by coreutils timeout.
    let limit = format!("{}.{:03}", time_limit_ms / 1000, time_limit_ms % 1000);

    format!(
        r#"#!/bin/sh
n={count}
fail_fast={fail_fast}
i=0
while [ "$i" -lt "$n" ]; do
  idx=$(printf '%03d' "$i")
  ( ulimit -f {blocks} && exec timeout -k 1 {limit} {run_command} ) < "input_$idx.txt" > "output_$idx.txt" 2> "error_$idx.txt"
  code=$?
  echo "$code" > "status_$idx.txt"
  if [ "$fail_fast" = 1 ] && [ "$code" -ne 0 ]; then
    break
  fi
  i=$((i + 1))
done
exit 0
"#,
        count = count,
        fail_fast = if fail_fast { 1 } else { 0 },
        limit = limit,
        blocks = file_size_blocks(output_limit_bytes),
        run_command = run_command,
    )
}

/// Wall-clock budget for the whole batch.
pub fn batch_budget(constraints: &Constraints, count: usize, startup_allowance_ms: u64) -> Duration {
    let per_case = constraints.time_limit_ms.saturating_add(100);
    Duration::from_millis(
        per_case
            .saturating_mul(count.max(1) as u64)
            .saturating_add(startup_allowance_ms),
    )
}

/// Verdict every unreported case inherits from the batch as a whole.
fn batch_verdict(status: ContainerStatus) -> Option<(Verdict, String)> {
    match status {
        ContainerStatus::Exited(0) => None,
        ContainerStatus::TimedOut => Some((Verdict::TimeLimitExceeded, "Time limit exceeded".into())),
        ContainerStatus::OomKilled => Some((Verdict::MemoryLimitExceeded, "Memory limit exceeded".into())),
        ContainerStatus::Exited(code) => Some((
            Verdict::RuntimeError,
            format!("Sandbox exited abnormally with code {}", code),
        )),
    }
}

/// Runs a compiled/interpreted program against every test case.
pub struct BatchExecutor {
    config: SandboxConfig,
    runtime: Arc<dyn ContainerRuntime>,
}

impl BatchExecutor {
    pub fn new(config: SandboxConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { config, runtime }
    }

    /// Execute the batch and classify every case.
    pub async fn execute(
        &self,
        profile: &LanguageProfile,
        workspace: &Workspace,
        testcases: &[Testcase],
        constraints: &Constraints,
        run_all_testcases: bool,
    ) -> Result<EvaluationOutcome, SandboxError> {
        for (index, tc) in testcases.iter().enumerate() {
            workspace.write(&input_file(index), tc.input.as_bytes()).await?;
        }

        let fail_fast = !run_all_testcases;
        let script = driver_script(
            &profile.run_command,
            testcases.len(),
            constraints.time_limit_ms,
            self.config.output_limit_bytes,
            fail_fast,
        );
        workspace.write(DRIVER_SCRIPT, script.as_bytes()).await?;

        let spec = ContainerSpec {
            image: profile.image.clone(),
            workspace: workspace.dir().to_path_buf(),
            command: vec!["sh".into(), DRIVER_SCRIPT.into()],
            memory_mb: constraints.memory_limit_mb,
            cpus: constraints.cpu_limit,
            pids_limit: self.config.pids_limit,
            timeout: batch_budget(constraints, testcases.len(), self.config.startup_allowance_ms),
        };

        let run = self.runtime.run(&spec).await?;
        let batch = batch_verdict(run.status);

        tracing::debug!(
            workspace_id = %workspace.id(),
            status = ?run.status,
            cases = testcases.len(),
            fail_fast,
            elapsed_ms = run.elapsed.as_millis() as u64,
            "Batch finished"
        );

        let mut results = Vec::with_capacity(testcases.len());
        for (index, tc) in testcases.iter().enumerate() {
            let result = self
                .classify_case(workspace, index, tc, batch.as_ref(), run.status)
                .await?;
            let failed = !result.verdict.is_accepted();
            results.push(result);

            // Fail-fast: nothing past the first failure is scored.
            if fail_fast && failed {
                break;
            }
        }

        Ok(EvaluationOutcome::from_results(
            results,
            testcases.len(),
            run.elapsed.as_millis() as u64,
        ))
    }

    async fn classify_case(
        &self,
        workspace: &Workspace,
        index: usize,
        tc: &Testcase,
        batch: Option<&(Verdict, String)>,
        status: ContainerStatus,
    ) -> Result<SingleTestcaseResult, SandboxError> {
        let mut result = SingleTestcaseResult {
            index,
            input: tc.input.clone(),
            expected_output: tc.output.clone(),
            actual_output: None,
            verdict: Verdict::RuntimeError,
            error: None,
        };

        let code = match read_status(workspace, index).await? {
            Some(code) => code,
            None => {
                // Case never reported: it inherits the batch-level verdict.
                let (verdict, error) = batch
                    .cloned()
                    .unwrap_or((Verdict::RuntimeError, "No result recorded for test case".into()));
                result.verdict = verdict;
                result.error = Some(error);
                return Ok(result);
            }
        };

        let limit = self.config.output_limit_bytes;
        if code == FILE_SIZE_EXIT || (code != 0 && output_len(workspace, index).await? > limit) {
            result.error = Some("Output limit exceeded".to_string());
            return Ok(result);
        }

        if code != 0 {
            let stderr = read_capped(workspace, &error_file(index), limit)
                .await?
                .unwrap_or_default();

            result.verdict = match code {
                TIMEOUT_EXIT => Verdict::TimeLimitExceeded,
                SIGKILL_EXIT if status == ContainerStatus::OomKilled => Verdict::MemoryLimitExceeded,
                SIGKILL_EXIT => Verdict::TimeLimitExceeded,
                _ => Verdict::RuntimeError,
            };
            result.error = Some(match result.verdict {
                Verdict::TimeLimitExceeded => "Time limit exceeded".to_string(),
                Verdict::MemoryLimitExceeded => "Memory limit exceeded".to_string(),
                _ if stderr.trim().is_empty() => format!("Process exited with code {}", code),
                _ => truncate(&stderr),
            });
            return Ok(result);
        }

        let Some(actual) = read_capped(workspace, &output_file(index), limit).await? else {
            result.error = Some("Output limit exceeded".to_string());
            return Ok(result);
        };

        result.verdict = if comparator::outputs_match(&actual, &tc.output) {
            Verdict::Accepted
        } else {
            Verdict::WrongAnswer
        };
        result.actual_output = Some(actual);

        Ok(result)
    }
}

/// Exit code recorded by the driver, `None` when the case never finished.
async fn read_status(workspace: &Workspace, index: usize) -> Result<Option<i32>, SandboxError> {
    match tokio::fs::read_to_string(workspace.path(&status_file(index))).await {
        Ok(text) => Ok(text.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn output_len(workspace: &Workspace, index: usize) -> Result<u64, SandboxError> {
    match tokio::fs::metadata(workspace.path(&output_file(index))).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Read a result file; `None` when it is larger than `limit` bytes. A
/// missing file reads as empty.
async fn read_capped(workspace: &Workspace, name: &str, limit: u64) -> Result<Option<String>, SandboxError> {
    let path = workspace.path(name);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.len() > limit => return Ok(None),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Some(String::new())),
        Err(e) => return Err(e.into()),
    }

    let bytes = tokio::fs::read(&path).await?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use agon_common::Language;
    use async_trait::async_trait;

    use super::*;
    use crate::container::ContainerRun;

    /// Runs the container command with plain `sh` in the workspace directory.
    struct LocalShell;

    #[async_trait]
    impl ContainerRuntime for LocalShell {
        async fn ensure_image(&self, _image: &str) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn run(&self, spec: &ContainerSpec) -> Result<ContainerRun, SandboxError> {
            let started = Instant::now();
            let output = tokio::process::Command::new(&spec.command[0])
                .args(&spec.command[1..])
                .current_dir(&spec.workspace)
                .kill_on_drop(true)
                .output();

            let status = match tokio::time::timeout(spec.timeout, output).await {
                Ok(output) => ContainerStatus::Exited(output?.status.code().unwrap_or(-1)),
                Err(_) => ContainerStatus::TimedOut,
            };

            Ok(ContainerRun {
                status,
                stdout: String::new(),
                stderr: String::new(),
                elapsed: started.elapsed(),
            })
        }
    }

    const OUTPUT_LIMIT: u64 = 1024;

    async fn run_program(
        program: &str,
        cases: &[(&str, &str)],
        time_limit_ms: u64,
        run_all: bool,
    ) -> (EvaluationOutcome, Workspace, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        workspace.write("prog.sh", program.as_bytes()).await.unwrap();

        let config = SandboxConfig {
            output_limit_bytes: OUTPUT_LIMIT,
            startup_allowance_ms: 5000,
            ..Default::default()
        };
        let profile = LanguageProfile {
            language: Language::Python,
            image: "local".to_string(),
            source_file: "prog.sh".to_string(),
            compile_command: None,
            run_command: "sh prog.sh".to_string(),
        };
        let testcases: Vec<Testcase> = cases.iter().map(|(i, o)| Testcase::new(*i, *o)).collect();
        let constraints = Constraints {
            time_limit_ms,
            ..Default::default()
        };

        let outcome = BatchExecutor::new(config, Arc::new(LocalShell))
            .execute(&profile, &workspace, &testcases, &constraints, run_all)
            .await
            .unwrap();

        (outcome, workspace, root)
    }

    fn executed_inputs(workspace: &Workspace) -> Vec<String> {
        std::fs::read_to_string(workspace.path("ran.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    const ECHO_LOGGED: &str = r#"read x
echo "$x" >> ran.log
"#;

    #[test]
    fn test_driver_fail_fast_flag() {
        let script = driver_script("./solution", 3, 1500, 4096, true);
        assert!(script.contains("n=3"));
        assert!(script.contains("fail_fast=1"));
        assert!(script.contains("timeout -k 1 1.500 ./solution"));

        let script = driver_script("python3 solution.py", 2, 2000, 4096, false);
        assert!(script.contains("fail_fast=0"));
        assert!(script.contains("timeout -k 1 2.000 python3 solution.py"));
    }

    #[test]
    fn test_driver_caps_file_size() {
        let script = driver_script("./solution", 1, 1000, 1024, true);
        assert!(script.contains("ulimit -f 3 && exec timeout"));
        assert_eq!(file_size_blocks(0), 1);
        assert_eq!(file_size_blocks(511), 1);
        assert_eq!(file_size_blocks(16 * 1024 * 1024), 32 * 1024 + 1);
        assert!(file_size_blocks(4096) * 512 > 4096);
    }

    #[test]
    fn test_file_names_are_indexed() {
        assert_eq!(input_file(0), "input_000.txt");
        assert_eq!(status_file(12), "status_012.txt");
        assert_eq!(output_file(7), "output_007.txt");
        assert_eq!(error_file(100), "error_100.txt");
    }

    #[test]
    fn test_batch_budget_scales_with_cases() {
        let constraints = Constraints {
            time_limit_ms: 1000,
            ..Default::default()
        };
        assert_eq!(batch_budget(&constraints, 3, 2000), Duration::from_millis(3 * 1100 + 2000));
        assert_eq!(batch_budget(&constraints, 0, 0), Duration::from_millis(1100));
    }

    #[test]
    fn test_batch_verdict_mapping() {
        assert_eq!(batch_verdict(ContainerStatus::Exited(0)), None);
        assert_eq!(
            batch_verdict(ContainerStatus::TimedOut).unwrap().0,
            Verdict::TimeLimitExceeded
        );
        assert_eq!(
            batch_verdict(ContainerStatus::OomKilled).unwrap().0,
            Verdict::MemoryLimitExceeded
        );
        assert_eq!(
            batch_verdict(ContainerStatus::Exited(2)).unwrap().0,
            Verdict::RuntimeError
        );
    }

    #[tokio::test]
    async fn test_fail_fast_never_runs_past_failing_exit() {
        let program = format!("{}[ \"$x\" != 2 ] || exit 3\necho \"$x\"\n", ECHO_LOGGED);
        let cases = [("1", "1"), ("2", "2"), ("3", "3")];

        let (outcome, workspace, _root) = run_program(&program, &cases, 2000, false).await;
        assert_eq!(executed_inputs(&workspace), vec!["1", "2"]);
        assert!(!workspace.path(&status_file(2)).exists());
        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!((outcome.passed, outcome.total), (1, 3));

        let (outcome, workspace, _root) = run_program(&program, &cases, 2000, true).await;
        assert_eq!(executed_inputs(&workspace), vec!["1", "2", "3"]);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.passed, 2);
    }

    #[tokio::test]
    async fn test_fail_fast_scores_nothing_after_wrong_answer() {
        let program = format!("{}if [ \"$x\" = 2 ]; then echo nope; else echo \"$x\"; fi\n", ECHO_LOGGED);
        let cases = [("1", "1"), ("2", "2"), ("3", "3")];

        let (outcome, workspace, _root) = run_program(&program, &cases, 2000, false).await;

        // Exit code 0: only scoring can tell the answer was wrong.
        assert_eq!(executed_inputs(&workspace).len(), 3);
        assert_eq!(outcome.verdict, Verdict::WrongAnswer);
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| r.index < 2));
        assert_eq!(outcome.failed_output.as_deref(), Some("nope\n"));
        assert_eq!((outcome.passed, outcome.total), (1, 3));
    }

    #[tokio::test]
    async fn test_output_flood_is_cut_off() {
        let (outcome, workspace, _root) = run_program("exec yes\n", &[("1", "y")], 5000, false).await;

        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert_eq!(outcome.error_message.as_deref(), Some("Output limit exceeded"));
        let written = std::fs::metadata(workspace.path(&output_file(0))).unwrap().len();
        assert!(written <= file_size_blocks(OUTPUT_LIMIT) * 512);
    }

    #[tokio::test]
    async fn test_output_flood_ignoring_xfsz_is_cut_off() {
        let (outcome, workspace, _root) =
            run_program("trap '' XFSZ\nexec yes\n", &[("1", "y")], 5000, false).await;

        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert_eq!(outcome.error_message.as_deref(), Some("Output limit exceeded"));
        let written = std::fs::metadata(workspace.path(&output_file(0))).unwrap().len();
        assert!(written <= file_size_blocks(OUTPUT_LIMIT) * 512);
    }

    #[tokio::test]
    async fn test_term_ignoring_loop_is_time_limit() {
        let program = "trap '' TERM\nwhile :; do :; done\n";
        let (outcome, workspace, _root) = run_program(program, &[("1", "1")], 200, false).await;

        let status = std::fs::read_to_string(workspace.path(&status_file(0))).unwrap();
        assert_eq!(status.trim(), SIGKILL_EXIT.to_string());
        assert_eq!(outcome.verdict, Verdict::TimeLimitExceeded);
        assert_eq!(outcome.error_message.as_deref(), Some("Time limit exceeded"));
    }
}

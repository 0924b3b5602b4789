//! Per-case results and their aggregation into one outcome.

use agon_common::Verdict;
use serde::{Deserialize, Serialize};

/// Longest diagnostic string kept on an outcome, in characters.
pub const DIAGNOSTIC_LIMIT: usize = 4096;

/// Result of executing a single test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleTestcaseResult {
    /// Test case index (0-based)
    pub index: usize,
    pub input: String,
    pub expected_output: String,
    pub actual_output: Option<String>,
    pub verdict: Verdict,
    pub error: Option<String>,
}

/// Aggregate over all test cases for one submission.
///
/// `verdict` is the verdict of the first case, in index order, that is not
/// `AC`; it is `AC` only when every case passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationOutcome {
    pub verdict: Verdict,
    pub passed: usize,
    pub total: usize,
    /// Wall-clock of the batch
    pub time_taken_ms: u64,
    pub failed_input: Option<String>,
    pub failed_expected: Option<String>,
    pub failed_output: Option<String>,
    pub error_message: Option<String>,
    pub results: Vec<SingleTestcaseResult>,
    /// Set when the outcome stands in for an infrastructure failure rather
    /// than a judgement of the code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_fault: Option<String>,
}

impl EvaluationOutcome {
    /// Aggregate per-case results. `total` is the number of cases in the
    /// batch; `results` may be shorter when the batch stopped early.
    pub fn from_results(results: Vec<SingleTestcaseResult>, total: usize, time_taken_ms: u64) -> Self {
        let passed = results.iter().filter(|r| r.verdict.is_accepted()).count();
        let first_failure = results.iter().find(|r| !r.verdict.is_accepted());

        let (verdict, failed_input, failed_expected, failed_output, error_message) = match first_failure {
            Some(r) => (
                r.verdict,
                Some(truncate(&r.input)),
                Some(truncate(&r.expected_output)),
                r.actual_output.as_deref().map(truncate),
                r.error.as_deref().map(truncate),
            ),
            None if passed == total => (Verdict::Accepted, None, None, None, None),
            None => (
                // Fewer results than cases with none failing: never report AC.
                Verdict::RuntimeError,
                None,
                None,
                None,
                Some(format!("only {} of {} test cases reported a result", passed, total)),
            ),
        };

        Self {
            verdict,
            passed,
            total,
            time_taken_ms,
            failed_input,
            failed_expected,
            failed_output,
            error_message,
            results,
            sandbox_fault: None,
        }
    }

    /// Build step failed; no case was executed.
    pub fn compile_error(total: usize, diagnostics: &str) -> Self {
        Self {
            verdict: Verdict::CompileError,
            passed: 0,
            total,
            time_taken_ms: 0,
            failed_input: None,
            failed_expected: None,
            failed_output: None,
            error_message: Some(truncate(diagnostics)),
            results: Vec::new(),
            sandbox_fault: None,
        }
    }

    /// The sandbox itself failed; the code was not judged.
    pub fn sandbox_fault(total: usize, reason: String) -> Self {
        Self {
            verdict: Verdict::RuntimeError,
            passed: 0,
            total,
            time_taken_ms: 0,
            failed_input: None,
            failed_expected: None,
            failed_output: None,
            error_message: Some(truncate(&reason)),
            results: Vec::new(),
            sandbox_fault: Some(reason),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict.is_accepted()
    }

    pub fn is_sandbox_fault(&self) -> bool {
        self.sandbox_fault.is_some()
    }
}

/// Cap a diagnostic string at [`DIAGNOSTIC_LIMIT`] characters.
pub fn truncate(text: &str) -> String {
    match text.char_indices().nth(DIAGNOSTIC_LIMIT) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

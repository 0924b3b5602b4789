//! Common types used across Agon services.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User ID type
pub type UserId = Uuid;

/// Contest ID type
pub type ContestId = Uuid;

/// Problem ID type
pub type ProblemId = Uuid;

/// Submission ID type
pub type SubmissionId = Uuid;

/// Final classification of one test case or one whole submission.
///
/// Verdicts carry no severity order. When several test cases fail, the
/// submission takes the verdict of the first failing case in index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    /// Output matched on every case
    #[serde(rename = "AC")]
    Accepted,
    /// Output does not match expected
    #[serde(rename = "WA")]
    WrongAnswer,
    /// Exceeded time limit
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    /// Exceeded memory limit
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    /// Program crashed or exited non-zero
    #[serde(rename = "RE")]
    RuntimeError,
    /// Build step failed
    #[serde(rename = "CE")]
    CompileError,
}

impl Verdict {
    /// Get short code for verdict
    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::RuntimeError => "RE",
            Verdict::CompileError => "CE",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AC" => Ok(Verdict::Accepted),
            "WA" => Ok(Verdict::WrongAnswer),
            "TLE" => Ok(Verdict::TimeLimitExceeded),
            "MLE" => Ok(Verdict::MemoryLimitExceeded),
            "RE" => Ok(Verdict::RuntimeError),
            "CE" => Ok(Verdict::CompileError),
            other => Err(format!("unknown verdict: {}", other)),
        }
    }
}

/// Supported language for submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "c++")]
    Cpp,
    C,
    Rust,
    Go,
    #[serde(alias = "python3")]
    Python,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Cpp,
        Language::C,
        Language::Rust,
        Language::Go,
        Language::Python,
    ];
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Cpp => write!(f, "cpp"),
            Language::C => write!(f, "c"),
            Language::Rust => write!(f, "rust"),
            Language::Go => write!(f, "go"),
            Language::Python => write!(f, "python"),
        }
    }
}

/// A single input/expected-output pair owned by a problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Testcase {
    pub input: String,
    pub output: String,
    /// Visible to the user before judging
    #[serde(default)]
    pub is_sample: bool,
}

impl Testcase {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            is_sample: false,
        }
    }
}

/// Per-problem resource ceiling applied to every test case of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    /// CPU share in cores (e.g. `0.5`, `1.0`)
    pub cpu_limit: f64,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            time_limit_ms: 2000,
            memory_limit_mb: 256,
            cpu_limit: 1.0,
        }
    }
}

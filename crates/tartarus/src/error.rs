//! Errors raised by sandbox plumbing.
//!
//! None of these escape [`crate::Sandbox::evaluate`]; they are folded into
//! an [`crate::EvaluationOutcome`] flagged as a sandbox fault.

use agon_common::Language;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// Workspace or result file I/O failed
    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The container runtime could not run the container
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// No execution profile is registered for the language
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(Language),
}

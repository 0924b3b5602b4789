//! Tartarus - sandboxed evaluation engine for Agon
//!
//! Compiles one submission and runs it against a batch of test cases inside
//! a single resource-capped, network-less container, then classifies the
//! result into a verdict.

pub mod batch;
pub mod comparator;
pub mod compiler;
pub mod config;
pub mod container;
pub mod error;
pub mod languages;
pub mod orchestrator;
pub mod outcome;
pub mod workspace;

pub use config::SandboxConfig;
pub use container::{ContainerRuntime, DockerCli};
pub use error::SandboxError;
pub use orchestrator::{EvaluationRequest, Sandbox};
pub use outcome::{EvaluationOutcome, SingleTestcaseResult};

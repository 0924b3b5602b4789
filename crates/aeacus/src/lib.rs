//! Aeacus - evaluation worker for Agon
//!
//! Consumes submission jobs from a Redis Stream, judges them in the Tartarus
//! sandbox, stores the result and forwards first solves to the leaderboard.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod evaluator;
pub mod metrics;
pub mod pipeline;
pub mod scoring;
pub mod services;

pub use config::Config;
pub use consumer::EvaluationConsumer;
pub use pipeline::{Collaborators, EvaluationPipeline};

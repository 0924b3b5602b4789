//! Common types, errors, and queue plumbing shared by the Agon services.

pub mod error;
pub mod jobs;
pub mod queue;
pub mod types;

pub use error::{AppError, AppResult, Disposition};
pub use types::*;

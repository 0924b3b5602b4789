//! Seam between the pipeline and the sandbox.

use async_trait::async_trait;
use tartarus::{EvaluationOutcome, EvaluationRequest, Sandbox};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> EvaluationOutcome;
}

#[async_trait]
impl Evaluator for Sandbox {
    async fn evaluate(&self, request: &EvaluationRequest) -> EvaluationOutcome {
        Sandbox::evaluate(self, request).await
    }
}

//! HTTP clients for the problem, contest and submission services.

use std::time::Duration;

use agon_common::{Constraints, ContestId, Disposition, ProblemId, SubmissionId, Testcase, Verdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ServicesConfig;

/// Header carrying the shared secret on internal calls.
pub const INTERNAL_KEY_HEADER: &str = "x-internal-api-key";

type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{service} responded with {status}")]
    Status { service: &'static str, status: StatusCode },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    /// Whether asking again later could give a different answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Transport(_) => true,
            ServiceError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            ServiceError::NotFound(_) | ServiceError::InvalidResponse(_) => false,
        }
    }
}

impl From<ServiceError> for Disposition {
    fn from(e: ServiceError) -> Self {
        if e.is_retryable() {
            Disposition::Retryable(e.to_string())
        } else {
            Disposition::Fatal(e.to_string())
        }
    }
}

/// Problem as served by the problem service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemContext {
    pub testcases: Vec<Testcase>,
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub max_score: u32,
}

impl ProblemContext {
    pub fn constraints(&self) -> Constraints {
        Constraints {
            time_limit_ms: self.time_limit_ms,
            memory_limit_mb: self.memory_limit_mb,
            cpu_limit: self.cpu_limit,
        }
    }

    pub fn samples(&self) -> Vec<Testcase> {
        self.testcases.iter().filter(|tc| tc.is_sample).cloned().collect()
    }
}

/// Contest timing, used for contest-relative penalties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContestWindow {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Body of the internal `PATCH submission` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub verdict: Verdict,
    pub score: u32,
    /// Wall-clock of the batch
    pub time_taken_ms: u64,
    /// Execution time in practice mode, time since contest start otherwise
    pub penalty_time_ms: u64,
    pub passed_testcases: usize,
    pub total_testcases: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Read-only lookups of problem and contest context.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProblemDirectory: Send + Sync {
    async fn problem(&self, id: ProblemId) -> Result<ProblemContext>;
    async fn contest(&self, id: ContestId) -> Result<ContestWindow>;
}

/// Upsert of a judged result into the submission record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn persist(&self, id: SubmissionId, result: &EvaluationResult) -> Result<()>;
}

/// reqwest-backed implementation of both collaborators.
#[derive(Debug, Clone)]
pub struct HttpServices {
    client: Client,
    config: ServicesConfig,
}

impl HttpServices {
    pub fn new(config: ServicesConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    fn url(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        service: &'static str,
        what: String,
        url: String,
    ) -> Result<T> {
        let res = self.client.get(&url).send().await?;
        match res.status() {
            StatusCode::NOT_FOUND => Err(ServiceError::NotFound(what)),
            status if !status.is_success() => Err(ServiceError::Status { service, status }),
            _ => res
                .json()
                .await
                .map_err(|e| ServiceError::InvalidResponse(format!("{}: {}", what, e))),
        }
    }
}

#[async_trait]
impl ProblemDirectory for HttpServices {
    async fn problem(&self, id: ProblemId) -> Result<ProblemContext> {
        let url = Self::url(&self.config.problem_service_url, &format!("problems/{}", id));
        self.get_json("problem service", format!("problem {}", id), url).await
    }

    async fn contest(&self, id: ContestId) -> Result<ContestWindow> {
        let url = Self::url(&self.config.contest_service_url, &format!("contests/{}", id));
        self.get_json("contest service", format!("contest {}", id), url).await
    }
}

#[async_trait]
impl SubmissionStore for HttpServices {
    async fn persist(&self, id: SubmissionId, result: &EvaluationResult) -> Result<()> {
        let url = Self::url(
            &self.config.submission_service_url,
            &format!("submissions/{}", id),
        );

        let res = self
            .client
            .patch(&url)
            .header(INTERNAL_KEY_HEADER, &self.config.internal_api_key)
            .json(result)
            .send()
            .await?;

        match res.status() {
            StatusCode::NOT_FOUND => Err(ServiceError::NotFound(format!("submission {}", id))),
            status if !status.is_success() => Err(ServiceError::Status {
                service: "submission service",
                status,
            }),
            _ => Ok(()),
        }
    }
}

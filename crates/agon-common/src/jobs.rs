//! Queue payloads exchanged between the submission service, the evaluation
//! worker and the leaderboard engine.
//!
//! The evaluation payload travels on the wire in the flat shape the
//! submission service produces (`isRunOnly` plus optional fields) and is
//! converted into [`EvaluationJob`] on receipt, where the two modes are
//! disjoint variants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::{ContestId, Language, ProblemId, SubmissionId, Testcase, UserId};

/// Evaluation request for one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EnqueuePayload", into = "EnqueuePayload")]
pub struct EvaluationJob {
    pub submission_id: SubmissionId,
    pub user_id: UserId,
    pub problem_id: ProblemId,
    pub language: Language,
    pub code: String,
    pub correlation_id: Option<String>,
    pub mode: JobMode,
}

/// The two payload shapes an evaluation job can take.
#[derive(Debug, Clone, PartialEq)]
pub enum JobMode {
    /// Ad-hoc "Run": never scored, persisted or ranked.
    Run {
        /// Caller-supplied cases; when absent the problem's samples are used.
        testcases: Option<Vec<Testcase>>,
    },
    /// Scored "Submit".
    Submit {
        /// `None` means practice mode.
        contest_id: Option<ContestId>,
        submission_created_at: Option<DateTime<Utc>>,
    },
}

impl EvaluationJob {
    pub fn is_run_only(&self) -> bool {
        matches!(self.mode, JobMode::Run { .. })
    }

    pub fn contest_id(&self) -> Option<ContestId> {
        match self.mode {
            JobMode::Submit { contest_id, .. } => contest_id,
            JobMode::Run { .. } => None,
        }
    }
}

/// Wire format of the evaluation queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuePayload {
    pub submission_id: SubmissionId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contest_id: Option<ContestId>,
    pub problem_id: ProblemId,
    pub language: Language,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_created_at: Option<DateTime<Utc>>,
    pub is_run_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub testcases: Option<Vec<Testcase>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl TryFrom<EnqueuePayload> for EvaluationJob {
    type Error = AppError;

    fn try_from(raw: EnqueuePayload) -> Result<Self, Self::Error> {
        if raw.code.trim().is_empty() {
            return Err(AppError::ValidationError(format!(
                "submission {} has empty source",
                raw.submission_id
            )));
        }

        let mode = if raw.is_run_only {
            JobMode::Run {
                testcases: raw.testcases,
            }
        } else {
            if raw.testcases.is_some() {
                return Err(AppError::ValidationError(format!(
                    "scored submission {} must not carry ad-hoc testcases",
                    raw.submission_id
                )));
            }
            JobMode::Submit {
                contest_id: raw.contest_id,
                submission_created_at: raw.submission_created_at,
            }
        };

        Ok(Self {
            submission_id: raw.submission_id,
            user_id: raw.user_id,
            problem_id: raw.problem_id,
            language: raw.language,
            code: raw.code,
            correlation_id: raw.correlation_id,
            mode,
        })
    }
}

impl From<EvaluationJob> for EnqueuePayload {
    fn from(job: EvaluationJob) -> Self {
        let (is_run_only, contest_id, submission_created_at, testcases) = match job.mode {
            JobMode::Run { testcases } => (true, None, None, testcases),
            JobMode::Submit {
                contest_id,
                submission_created_at,
            } => (false, contest_id, submission_created_at, None),
        };

        Self {
            submission_id: job.submission_id,
            user_id: job.user_id,
            contest_id,
            problem_id: job.problem_id,
            language: job.language,
            code: job.code,
            submission_created_at,
            is_run_only,
            testcases,
            correlation_id: job.correlation_id,
        }
    }
}

/// Request to credit a first solve on a contest leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardUpdateJob {
    pub submission_id: SubmissionId,
    pub contest_id: ContestId,
    pub user_id: UserId,
    /// Combined score (points plus inverse-penalty fraction)
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contest_end_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn raw(is_run_only: bool) -> serde_json::Value {
        serde_json::json!({
            "submissionId": Uuid::new_v4(),
            "userId": Uuid::new_v4(),
            "problemId": Uuid::new_v4(),
            "language": "cpp",
            "code": "int main() {}",
            "isRunOnly": is_run_only,
        })
    }

    #[test]
    fn test_submit_payload_becomes_submit_mode() {
        let mut value = raw(false);
        let contest = Uuid::new_v4();
        value["contestId"] = serde_json::json!(contest);
        value["submissionCreatedAt"] = serde_json::json!("2024-01-15T12:05:00Z");

        let job: EvaluationJob = serde_json::from_value(value).unwrap();
        assert!(!job.is_run_only());
        assert_eq!(job.contest_id(), Some(contest));
        match job.mode {
            JobMode::Submit {
                submission_created_at,
                ..
            } => assert!(submission_created_at.is_some()),
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_run_payload_drops_contest() {
        let mut value = raw(true);
        value["contestId"] = serde_json::json!(Uuid::new_v4());
        value["testcases"] = serde_json::json!([{ "input": "1", "output": "1" }]);

        let job: EvaluationJob = serde_json::from_value(value).unwrap();
        assert!(job.is_run_only());
        assert_eq!(job.contest_id(), None);
        match &job.mode {
            JobMode::Run { testcases } => assert_eq!(testcases.as_ref().unwrap().len(), 1),
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_submit_with_testcases_rejected() {
        let mut value = raw(false);
        value["testcases"] = serde_json::json!([]);
        assert!(serde_json::from_value::<EvaluationJob>(value).is_err());
    }

    #[test]
    fn test_empty_code_rejected() {
        let mut value = raw(true);
        value["code"] = serde_json::json!("   \n");
        assert!(serde_json::from_value::<EvaluationJob>(value).is_err());
    }

    #[test]
    fn test_wire_shape_preserved() {
        let job: EvaluationJob = serde_json::from_value(raw(false)).unwrap();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["isRunOnly"], serde_json::json!(false));
        assert!(value.get("testcases").is_none());
        assert!(value.get("contestId").is_none());
    }
}

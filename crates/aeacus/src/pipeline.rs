//! Per-job evaluation pipeline.
//!
//! `RECEIVED → CONTEXT_FETCHED → EXECUTED → SCORED → PERSISTED →
//! (RANKED | SKIPPED) → DONE`, or `FAILED` with a [`Disposition`] telling the
//! queue whether to redeliver. The pipeline never retries on its own.

use std::sync::Arc;
use std::time::Instant;

use agon_common::jobs::{EvaluationJob, JobMode, LeaderboardUpdateJob};
use agon_common::{ContestId, Disposition, Testcase};
use chrono::{DateTime, Utc};
use tartarus::{EvaluationOutcome, EvaluationRequest};

use crate::broker::{Outbox, SolveMarkers};
use crate::evaluator::Evaluator;
use crate::metrics::{self, LEADERBOARD_FORWARDED, PERSIST_FAILURES};
use crate::scoring;
use crate::services::{
    ContestWindow, EvaluationResult, ProblemContext, ProblemDirectory, SubmissionStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    ContextFetched,
    Executed,
    Scored,
    Persisted,
    Ranked,
    Skipped,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "RECEIVED",
            Stage::ContextFetched => "CONTEXT_FETCHED",
            Stage::Executed => "EXECUTED",
            Stage::Scored => "SCORED",
            Stage::Persisted => "PERSISTED",
            Stage::Ranked => "RANKED",
            Stage::Skipped => "SKIPPED",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        }
    }
}

/// Collaborators of the pipeline.
pub struct Collaborators {
    pub directory: Arc<dyn ProblemDirectory>,
    pub store: Arc<dyn SubmissionStore>,
    pub evaluator: Arc<dyn Evaluator>,
    pub markers: Arc<dyn SolveMarkers>,
    pub outbox: Arc<dyn Outbox>,
}

pub struct EvaluationPipeline {
    directory: Arc<dyn ProblemDirectory>,
    store: Arc<dyn SubmissionStore>,
    evaluator: Arc<dyn Evaluator>,
    markers: Arc<dyn SolveMarkers>,
    outbox: Arc<dyn Outbox>,
    marker_grace_secs: u64,
}

/// Context resolved in the first step.
struct JobContext {
    problem: ProblemContext,
    testcases: Vec<Testcase>,
    contest: Option<(ContestId, ContestWindow)>,
}

impl EvaluationPipeline {
    pub fn new(collaborators: Collaborators, marker_grace_secs: u64) -> Self {
        Self {
            directory: collaborators.directory,
            store: collaborators.store,
            evaluator: collaborators.evaluator,
            markers: collaborators.markers,
            outbox: collaborators.outbox,
            marker_grace_secs,
        }
    }

    /// Take one job through every stage.
    pub async fn process(&self, job: &EvaluationJob) -> Disposition {
        let started = Instant::now();
        let received_at = Utc::now();
        transition(job, Stage::Received);

        let result = self.run(job, received_at).await;

        let kind = if job.is_run_only() { "run" } else { "submit" };
        metrics::record_duration(kind, started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                transition(job, Stage::Done);
                Disposition::Completed
            }
            Err(disposition) => {
                tracing::debug!(
                    submission_id = %job.submission_id,
                    stage = Stage::Failed.as_str(),
                    disposition = disposition.label(),
                    "Pipeline failed: {:?}",
                    disposition
                );
                disposition
            }
        }
    }

    async fn run(&self, job: &EvaluationJob, received_at: DateTime<Utc>) -> Result<(), Disposition> {
        let ctx = self.fetch_context(job).await?;
        transition(job, Stage::ContextFetched);

        let request = EvaluationRequest {
            code: job.code.clone(),
            language: job.language,
            testcases: ctx.testcases,
            constraints: ctx.problem.constraints(),
            run_all_testcases: job.is_run_only(),
        };

        let outcome = self.evaluator.evaluate(&request).await;
        if let Some(fault) = &outcome.sandbox_fault {
            return Err(Disposition::Retryable(format!("sandbox fault: {}", fault)));
        }
        transition(job, Stage::Executed);
        metrics::record_verdict(outcome.verdict.code());

        if job.is_run_only() {
            self.outbox.publish_run(job.submission_id, &outcome).await?;
            return Ok(());
        }

        let submitted_at = match job.mode {
            JobMode::Submit {
                submission_created_at: Some(at),
                ..
            } => at,
            _ => received_at,
        };
        let points = scoring::award(&outcome, ctx.problem.max_score);
        let penalty_ms = scoring::penalty_ms(
            &outcome,
            submitted_at,
            ctx.contest.as_ref().map(|(_, window)| window),
        );
        transition(job, Stage::Scored);

        self.persist(job, &outcome, points, penalty_ms).await;

        match ctx.contest {
            Some((contest_id, window)) if outcome.is_accepted() => {
                self.rank(job, contest_id, &window, points, penalty_ms).await
            }
            _ => {
                transition(job, Stage::Skipped);
                Ok(())
            }
        }
    }

    async fn fetch_context(&self, job: &EvaluationJob) -> Result<JobContext, Disposition> {
        let problem = self.directory.problem(job.problem_id).await?;

        let (testcases, contest) = match &job.mode {
            JobMode::Run {
                testcases: Some(adhoc),
            } if !adhoc.is_empty() => (adhoc.clone(), None),
            JobMode::Run { .. } => (problem.samples(), None),
            JobMode::Submit { contest_id, .. } => {
                if problem.testcases.is_empty() {
                    return Err(Disposition::Fatal(format!(
                        "problem {} has no testcases",
                        job.problem_id
                    )));
                }
                let contest = match contest_id {
                    Some(id) => Some((*id, self.directory.contest(*id).await?)),
                    None => None,
                };
                (problem.testcases.clone(), contest)
            }
        };

        Ok(JobContext {
            problem,
            testcases,
            contest,
        })
    }

    /// Store the result. A failure is reported and does not stop the job.
    async fn persist(&self, job: &EvaluationJob, outcome: &EvaluationOutcome, points: u32, penalty_ms: u64) {
        let result = EvaluationResult {
            verdict: outcome.verdict,
            score: points,
            time_taken_ms: outcome.time_taken_ms,
            penalty_time_ms: penalty_ms,
            passed_testcases: outcome.passed,
            total_testcases: outcome.total,
            failed_input: outcome.failed_input.clone(),
            failed_expected: outcome.failed_expected.clone(),
            failed_output: outcome.failed_output.clone(),
            error_message: outcome.error_message.clone(),
        };

        match self.store.persist(job.submission_id, &result).await {
            Ok(()) => transition(job, Stage::Persisted),
            Err(e) => {
                PERSIST_FAILURES.inc();
                tracing::warn!(
                    submission_id = %job.submission_id,
                    "Failed to persist evaluation result, continuing: {}",
                    e
                );
            }
        }
    }

    async fn rank(
        &self,
        job: &EvaluationJob,
        contest_id: ContestId,
        window: &ContestWindow,
        points: u32,
        penalty_ms: u64,
    ) -> Result<(), Disposition> {
        let claim = self
            .markers
            .claim(
                contest_id,
                job.user_id,
                job.problem_id,
                job.submission_id,
                scoring::marker_expiry(window, self.marker_grace_secs),
            )
            .await?;

        if !claim.earns_credit() {
            tracing::debug!(
                submission_id = %job.submission_id,
                contest_id = %contest_id,
                "Problem already solved, leaderboard unchanged"
            );
            transition(job, Stage::Skipped);
            return Ok(());
        }

        let update = LeaderboardUpdateJob {
            submission_id: job.submission_id,
            contest_id,
            user_id: job.user_id,
            score: scoring::combined_score(points, penalty_ms),
            contest_end_time: Some(window.end_time),
        };
        self.outbox.forward_update(&update).await?;
        LEADERBOARD_FORWARDED.inc();

        transition(job, Stage::Ranked);
        Ok(())
    }
}

fn transition(job: &EvaluationJob, stage: Stage) {
    tracing::debug!(
        submission_id = %job.submission_id,
        correlation_id = job.correlation_id.as_deref().unwrap_or("-"),
        stage = stage.as_str(),
        "Pipeline transition"
    );
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use agon_common::{AppError, Language, Verdict};
    use chrono::{Duration, TimeZone};
    use reqwest::StatusCode;
    use tartarus::SingleTestcaseResult;
    use uuid::Uuid;

    use super::*;
    use crate::broker::{MarkerClaim, MockOutbox, MockSolveMarkers};
    use crate::evaluator::MockEvaluator;
    use crate::services::{MockProblemDirectory, MockSubmissionStore, ServiceError};

    fn problem() -> ProblemContext {
        ProblemContext {
            testcases: vec![
                Testcase {
                    input: "1 2".into(),
                    output: "3".into(),
                    is_sample: true,
                },
                Testcase::new("2 2", "4"),
                Testcase::new("5 5", "10"),
            ],
            time_limit_ms: 1000,
            memory_limit_mb: 256,
            cpu_limit: 1.0,
            max_score: 100,
        }
    }

    fn window() -> ContestWindow {
        ContestWindow {
            start_time: Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap(),
        }
    }

    fn job(mode: JobMode) -> EvaluationJob {
        EvaluationJob {
            submission_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            problem_id: Uuid::new_v4(),
            language: Language::Python,
            code: "print(sum(map(int, input().split())))".into(),
            correlation_id: None,
            mode,
        }
    }

    fn contest_job(contest_id: ContestId, minutes_in: i64) -> EvaluationJob {
        job(JobMode::Submit {
            contest_id: Some(contest_id),
            submission_created_at: Some(window().start_time + Duration::minutes(minutes_in)),
        })
    }

    fn outcome(verdict: Verdict, cases: usize) -> EvaluationOutcome {
        let results = (0..cases)
            .map(|index| SingleTestcaseResult {
                index,
                input: String::new(),
                expected_output: String::new(),
                actual_output: Some(String::new()),
                verdict,
                error: None,
            })
            .collect();
        EvaluationOutcome::from_results(results, cases, 42)
    }

    struct Mocks {
        directory: MockProblemDirectory,
        store: MockSubmissionStore,
        evaluator: MockEvaluator,
        markers: MockSolveMarkers,
        outbox: MockOutbox,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                directory: MockProblemDirectory::new(),
                store: MockSubmissionStore::new(),
                evaluator: MockEvaluator::new(),
                markers: MockSolveMarkers::new(),
                outbox: MockOutbox::new(),
            }
        }

        fn with_problem(mut self) -> Self {
            self.directory.expect_problem().returning(|_| Ok(problem()));
            self.directory.expect_contest().returning(|_| Ok(window()));
            self
        }

        fn build(self) -> EvaluationPipeline {
            EvaluationPipeline::new(
                Collaborators {
                    directory: Arc::new(self.directory),
                    store: Arc::new(self.store),
                    evaluator: Arc::new(self.evaluator),
                    markers: Arc::new(self.markers),
                    outbox: Arc::new(self.outbox),
                },
                3600,
            )
        }
    }

    #[tokio::test]
    async fn test_run_only_uses_adhoc_cases_and_skips_grading() {
        let mut mocks = Mocks::new().with_problem();
        mocks
            .evaluator
            .expect_evaluate()
            .withf(|req| req.run_all_testcases && req.testcases.len() == 1 && req.testcases[0].input == "9")
            .times(1)
            .returning(|_| outcome(Verdict::Accepted, 1));
        mocks.outbox.expect_publish_run().times(1).returning(|_, _| Ok(()));
        mocks.outbox.expect_forward_update().never();
        mocks.store.expect_persist().never();
        mocks.markers.expect_claim().never();

        let pipeline = mocks.build();
        let job = job(JobMode::Run {
            testcases: Some(vec![Testcase::new("9", "9")]),
        });

        assert_eq!(pipeline.process(&job).await, Disposition::Completed);
    }

    #[tokio::test]
    async fn test_run_only_defaults_to_samples() {
        let mut mocks = Mocks::new().with_problem();
        mocks
            .evaluator
            .expect_evaluate()
            .withf(|req| req.testcases.len() == 1 && req.testcases[0].is_sample)
            .times(1)
            .returning(|_| outcome(Verdict::WrongAnswer, 1));
        mocks.outbox.expect_publish_run().times(1).returning(|_, _| Ok(()));

        let pipeline = mocks.build();
        let job = job(JobMode::Run { testcases: None });

        assert_eq!(pipeline.process(&job).await, Disposition::Completed);
    }

    #[tokio::test]
    async fn test_practice_accept_persists_without_ranking() {
        let mut mocks = Mocks::new().with_problem();
        mocks
            .evaluator
            .expect_evaluate()
            .withf(|req| !req.run_all_testcases && req.testcases.len() == 3)
            .returning(|_| outcome(Verdict::Accepted, 3));
        mocks
            .store
            .expect_persist()
            .withf(|_, result| result.score == 100 && result.penalty_time_ms == 42)
            .times(1)
            .returning(|_, _| Ok(()));
        mocks.markers.expect_claim().never();
        mocks.outbox.expect_forward_update().never();

        let pipeline = mocks.build();
        let job = job(JobMode::Submit {
            contest_id: None,
            submission_created_at: None,
        });

        assert_eq!(pipeline.process(&job).await, Disposition::Completed);
    }

    #[tokio::test]
    async fn test_contest_penalty_is_time_since_start() {
        let contest = Uuid::new_v4();
        let mut mocks = Mocks::new().with_problem();
        mocks
            .evaluator
            .expect_evaluate()
            .returning(|_| outcome(Verdict::Accepted, 3));
        mocks
            .store
            .expect_persist()
            .withf(|_, result| result.penalty_time_ms == 5 * 60 * 1000 && result.time_taken_ms == 42)
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .markers
            .expect_claim()
            .times(1)
            .returning(|_, _, _, _, _| Ok(MarkerClaim::First));
        mocks
            .outbox
            .expect_forward_update()
            .withf(move |update| {
                update.contest_id == contest
                    && update.score == scoring::combined_score(100, 5 * 60 * 1000)
                    && update.contest_end_time == Some(window().end_time)
            })
            .times(1)
            .returning(|_| Ok(()));

        let pipeline = mocks.build();
        assert_eq!(
            pipeline.process(&contest_job(contest, 5)).await,
            Disposition::Completed
        );
    }

    #[tokio::test]
    async fn test_second_accept_never_reaches_leaderboard() {
        let contest = Uuid::new_v4();
        let mut mocks = Mocks::new().with_problem();
        mocks
            .evaluator
            .expect_evaluate()
            .returning(|_| outcome(Verdict::Accepted, 3));
        mocks.store.expect_persist().times(2).returning(|_, _| Ok(()));

        let taken: Arc<Mutex<HashSet<String>>> = Arc::default();
        mocks
            .markers
            .expect_claim()
            .times(2)
            .returning(move |c, u, p, _, _| {
                let fresh = taken.lock().unwrap().insert(format!("{}:{}:{}", c, u, p));
                Ok(if fresh { MarkerClaim::First } else { MarkerClaim::AlreadySolved })
            });
        mocks.outbox.expect_forward_update().times(1).returning(|_| Ok(()));

        let pipeline = mocks.build();
        let first = contest_job(contest, 10);
        let mut second = contest_job(contest, 3);
        second.user_id = first.user_id;
        second.problem_id = first.problem_id;

        assert_eq!(pipeline.process(&first).await, Disposition::Completed);
        assert_eq!(pipeline.process(&second).await, Disposition::Completed);
    }

    #[tokio::test]
    async fn test_wrong_answer_in_contest_is_not_ranked() {
        let mut mocks = Mocks::new().with_problem();
        mocks
            .evaluator
            .expect_evaluate()
            .returning(|_| outcome(Verdict::WrongAnswer, 1));
        mocks
            .store
            .expect_persist()
            .withf(|_, result| result.score == 0 && result.verdict == Verdict::WrongAnswer)
            .returning(|_, _| Ok(()));
        mocks.markers.expect_claim().never();
        mocks.outbox.expect_forward_update().never();

        let pipeline = mocks.build();
        assert_eq!(
            pipeline.process(&contest_job(Uuid::new_v4(), 1)).await,
            Disposition::Completed
        );
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_block_ranking() {
        let mut mocks = Mocks::new().with_problem();
        mocks
            .evaluator
            .expect_evaluate()
            .returning(|_| outcome(Verdict::Accepted, 3));
        mocks.store.expect_persist().returning(|_, _| {
            Err(ServiceError::Status {
                service: "submission service",
                status: StatusCode::SERVICE_UNAVAILABLE,
            })
        });
        mocks
            .markers
            .expect_claim()
            .returning(|_, _, _, _, _| Ok(MarkerClaim::First));
        mocks.outbox.expect_forward_update().times(1).returning(|_| Ok(()));

        let pipeline = mocks.build();
        assert_eq!(
            pipeline.process(&contest_job(Uuid::new_v4(), 1)).await,
            Disposition::Completed
        );
    }

    #[tokio::test]
    async fn test_redelivery_after_lost_forward_is_credited() {
        let mut mocks = Mocks::new().with_problem();
        mocks
            .evaluator
            .expect_evaluate()
            .returning(|_| outcome(Verdict::Accepted, 3));
        mocks.store.expect_persist().returning(|_, _| Ok(()));
        mocks
            .markers
            .expect_claim()
            .returning(|_, _, _, _, _| Ok(MarkerClaim::Redelivered));
        mocks.outbox.expect_forward_update().times(1).returning(|_| Ok(()));

        let pipeline = mocks.build();
        assert_eq!(
            pipeline.process(&contest_job(Uuid::new_v4(), 1)).await,
            Disposition::Completed
        );
    }

    #[tokio::test]
    async fn test_forward_failure_is_retryable() {
        let mut mocks = Mocks::new().with_problem();
        mocks
            .evaluator
            .expect_evaluate()
            .returning(|_| outcome(Verdict::Accepted, 3));
        mocks.store.expect_persist().returning(|_, _| Ok(()));
        mocks
            .markers
            .expect_claim()
            .returning(|_, _, _, _, _| Ok(MarkerClaim::First));
        mocks
            .outbox
            .expect_forward_update()
            .returning(|_| Err(AppError::CacheError("connection refused".into())));

        let pipeline = mocks.build();
        let disposition = pipeline.process(&contest_job(Uuid::new_v4(), 1)).await;
        assert!(matches!(disposition, Disposition::Retryable(_)));
    }

    #[tokio::test]
    async fn test_sandbox_fault_is_retryable_and_not_stored() {
        let mut mocks = Mocks::new().with_problem();
        mocks.evaluator.expect_evaluate().returning(|_| {
            EvaluationOutcome::sandbox_fault(3, "docker daemon unreachable".into())
        });
        mocks.store.expect_persist().never();
        mocks.outbox.expect_forward_update().never();

        let pipeline = mocks.build();
        let disposition = pipeline.process(&contest_job(Uuid::new_v4(), 1)).await;
        assert!(matches!(disposition, Disposition::Retryable(reason) if reason.contains("docker")));
    }

    #[tokio::test]
    async fn test_missing_problem_is_fatal() {
        let mut mocks = Mocks::new();
        mocks
            .directory
            .expect_problem()
            .returning(|id| Err(ServiceError::NotFound(format!("problem {}", id))));
        mocks.evaluator.expect_evaluate().never();

        let pipeline = mocks.build();
        let disposition = pipeline.process(&contest_job(Uuid::new_v4(), 1)).await;
        assert!(matches!(disposition, Disposition::Fatal(_)));
    }

    #[tokio::test]
    async fn test_problem_service_outage_is_retryable() {
        let mut mocks = Mocks::new();
        mocks.directory.expect_problem().returning(|_| {
            Err(ServiceError::Status {
                service: "problem service",
                status: StatusCode::BAD_GATEWAY,
            })
        });
        mocks.evaluator.expect_evaluate().never();

        let pipeline = mocks.build();
        let disposition = pipeline.process(&contest_job(Uuid::new_v4(), 1)).await;
        assert!(matches!(disposition, Disposition::Retryable(_)));
    }

    #[tokio::test]
    async fn test_submit_without_testcases_is_fatal() {
        let mut mocks = Mocks::new();
        mocks.directory.expect_problem().returning(|_| {
            Ok(ProblemContext {
                testcases: Vec::new(),
                time_limit_ms: 1000,
                memory_limit_mb: 256,
                cpu_limit: 1.0,
                max_score: 100,
            })
        });
        mocks.evaluator.expect_evaluate().never();

        let pipeline = mocks.build();
        let disposition = pipeline
            .process(&job(JobMode::Submit {
                contest_id: None,
                submission_created_at: None,
            }))
            .await;
        assert!(matches!(disposition, Disposition::Fatal(_)));
    }
}

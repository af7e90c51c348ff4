//! Completion evaluation for running jobs.
//!
//! Checks run in a fixed priority order and the first match wins:
//! terminal state, execution time, token budget, cost budget, stall,
//! exhausted retries, success pattern, failure pattern.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, Job, JobCompletionCriteria, JobStatus};

/// Why a job was judged complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionReason {
    TerminalState { status: JobStatus },
    ExecutionTimeExceeded { elapsed: Duration, limit: Duration },
    TokenLimitReached { tokens: u64, limit: u64 },
    CostLimitReached { cost_usd: f64, limit_usd: f64 },
    Stalled { idle: Duration, limit: Duration },
    RetriesExhausted { retry_count: u32, max_retries: u32 },
    SuccessPatternMatched,
    FailurePatternMatched,
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TerminalState { status } => write!(f, "job reached terminal state {status}"),
            Self::ExecutionTimeExceeded { elapsed, limit } => write!(
                f,
                "execution time {}s exceeded limit of {}s",
                elapsed.as_secs(),
                limit.as_secs()
            ),
            Self::TokenLimitReached { tokens, limit } => {
                write!(f, "output tokens {tokens} reached limit of {limit}")
            }
            Self::CostLimitReached {
                cost_usd,
                limit_usd,
            } => write!(f, "cost ${cost_usd:.2} reached limit of ${limit_usd:.2}"),
            Self::Stalled { idle, limit } => write!(
                f,
                "no activity for {}s (stall timeout {}s)",
                idle.as_secs(),
                limit.as_secs()
            ),
            Self::RetriesExhausted {
                retry_count,
                max_retries,
            } => write!(f, "stalled with retries exhausted ({retry_count}/{max_retries})"),
            Self::SuccessPatternMatched => f.write_str("output matched success pattern"),
            Self::FailurePatternMatched => f.write_str("output matched failure pattern"),
        }
    }
}

/// Result of evaluating a job against its completion criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvaluation {
    pub is_complete: bool,
    pub reason: Option<CompletionReason>,
    /// The job should be moved to `Failed`.
    pub should_fail: bool,
    /// The job should be reset and attempted again.
    pub should_retry: bool,
}

impl CompletionEvaluation {
    pub fn incomplete() -> Self {
        Self {
            is_complete: false,
            reason: None,
            should_fail: false,
            should_retry: false,
        }
    }

    fn complete(reason: CompletionReason) -> Self {
        Self {
            is_complete: true,
            reason: Some(reason),
            should_fail: false,
            should_retry: false,
        }
    }

    fn failed(reason: CompletionReason) -> Self {
        Self {
            should_fail: true,
            ..Self::complete(reason)
        }
    }
}

pub(crate) fn evaluate(
    job: &Job,
    criteria: &JobCompletionCriteria,
    now: DateTime<Utc>,
) -> Result<CompletionEvaluation, CoreError> {
    let patterns = criteria.compiled_patterns()?;
    let status = job.status();

    if status.is_terminal() {
        return Ok(CompletionEvaluation::complete(
            CompletionReason::TerminalState { status },
        ));
    }

    if let (Some(limit), Some(elapsed)) = (criteria.max_execution_time, job.elapsed(now)) {
        let elapsed = elapsed.to_std().unwrap_or_default();
        if elapsed > limit {
            return Ok(CompletionEvaluation::failed(
                CompletionReason::ExecutionTimeExceeded { elapsed, limit },
            ));
        }
    }

    if let Some(limit) = criteria.max_tokens {
        if job.output_tokens >= limit {
            return Ok(CompletionEvaluation::complete(
                CompletionReason::TokenLimitReached {
                    tokens: job.output_tokens,
                    limit,
                },
            ));
        }
    }

    if let Some(limit_usd) = criteria.max_cost_usd {
        if job.cost_usd >= limit_usd {
            return Ok(CompletionEvaluation::complete(
                CompletionReason::CostLimitReached {
                    cost_usd: job.cost_usd,
                    limit_usd,
                },
            ));
        }
    }

    if let (Some(limit), Some(idle)) = (criteria.stall_timeout, job.idle_for(now)) {
        let idle = idle.to_std().unwrap_or_default();
        if idle > limit {
            return Ok(CompletionEvaluation {
                should_retry: job.retries_remaining(),
                ..CompletionEvaluation::complete(CompletionReason::Stalled { idle, limit })
            });
        }
    }

    if !job.retries_remaining() && status == JobStatus::Stalled {
        return Ok(CompletionEvaluation::failed(
            CompletionReason::RetriesExhausted {
                retry_count: job.retry_count,
                max_retries: job.max_retries,
            },
        ));
    }

    if let Some(success) = &patterns.success {
        if success.is_match(&job.output) {
            return Ok(CompletionEvaluation::complete(
                CompletionReason::SuccessPatternMatched,
            ));
        }
    }

    if let Some(failure) = &patterns.failure {
        let haystack = format!(
            "{}{}",
            job.output,
            job.error_message.as_deref().unwrap_or_default()
        );
        if failure.is_match(&haystack) {
            return Ok(CompletionEvaluation::failed(
                CompletionReason::FailurePatternMatched,
            ));
        }
    }

    Ok(CompletionEvaluation::incomplete())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateMachine;
    use chrono::Duration as ChronoDuration;

    fn running_job() -> Job {
        let mut job = Job::new("proj", "Test job", "do something");
        StateMachine::try_transition(&mut job, JobStatus::Started, None);
        StateMachine::try_transition(&mut job, JobStatus::Processing, None);
        job
    }

    fn criteria() -> JobCompletionCriteria {
        JobCompletionCriteria {
            max_execution_time: Some(Duration::from_secs(30 * 60)),
            max_tokens: Some(1_000),
            max_cost_usd: Some(2.0),
            stall_timeout: Some(Duration::from_secs(5 * 60)),
            success_pattern: None,
            failure_pattern: None,
        }
    }

    #[test]
    fn test_fresh_running_job_is_incomplete() {
        let job = running_job();
        let eval = StateMachine::evaluate_completion(&job, &criteria()).unwrap();
        assert_eq!(eval, CompletionEvaluation::incomplete());
    }

    #[test]
    fn test_terminal_state_wins() {
        let mut job = running_job();
        job.output_tokens = 5_000;
        StateMachine::try_transition(&mut job, JobStatus::Completed, None);

        let eval = StateMachine::evaluate_completion(&job, &criteria()).unwrap();
        assert!(eval.is_complete);
        assert!(!eval.should_fail);
        assert_eq!(
            eval.reason,
            Some(CompletionReason::TerminalState {
                status: JobStatus::Completed
            })
        );
    }

    #[test]
    fn test_timeout_outranks_token_limit() {
        let now = Utc::now();
        let mut job = running_job();
        job.started_at = Some(now - ChronoDuration::minutes(45));
        job.output_tokens = 10_000;

        let eval = StateMachine::evaluate_completion_at(&job, &criteria(), now).unwrap();
        assert!(eval.is_complete);
        assert!(eval.should_fail);
        assert!(matches!(
            eval.reason,
            Some(CompletionReason::ExecutionTimeExceeded { .. })
        ));
    }

    #[test]
    fn test_budget_limits_are_not_failures() {
        let mut job = running_job();
        job.output_tokens = 1_000;
        let eval = StateMachine::evaluate_completion(&job, &criteria()).unwrap();
        assert!(eval.is_complete && !eval.should_fail);
        assert!(matches!(
            eval.reason,
            Some(CompletionReason::TokenLimitReached { tokens: 1_000, .. })
        ));

        let mut job = running_job();
        job.cost_usd = 2.5;
        let eval = StateMachine::evaluate_completion(&job, &criteria()).unwrap();
        assert!(eval.is_complete && !eval.should_fail);
        assert!(matches!(
            eval.reason,
            Some(CompletionReason::CostLimitReached { .. })
        ));
    }

    #[test]
    fn test_stall_with_retry_budget_exhausted() {
        let now = Utc::now();
        let mut job = running_job().with_max_retries(2);
        job.retry_count = 2;
        job.started_at = Some(now - ChronoDuration::minutes(12));
        job.last_activity_at = Some(now - ChronoDuration::minutes(10));

        let eval = StateMachine::evaluate_completion_at(&job, &criteria(), now).unwrap();
        assert!(eval.is_complete);
        assert!(!eval.should_retry);
        assert!(!eval.should_fail);
        assert!(matches!(eval.reason, Some(CompletionReason::Stalled { .. })));
    }

    #[test]
    fn test_stall_with_retries_left_recommends_retry() {
        let now = Utc::now();
        let mut job = running_job().with_max_retries(3);
        job.retry_count = 1;
        job.last_activity_at = Some(now - ChronoDuration::minutes(6));

        let eval = StateMachine::evaluate_completion_at(&job, &criteria(), now).unwrap();
        assert!(eval.is_complete);
        assert!(eval.should_retry);
    }

    #[test]
    fn test_stalled_job_out_of_retries_fails() {
        let mut job = running_job().with_max_retries(1);
        job.retry_count = 1;
        StateMachine::try_transition(&mut job, JobStatus::Stalled, None);

        let eval = StateMachine::evaluate_completion(&job, &criteria()).unwrap();
        assert!(eval.should_fail);
        assert_eq!(
            eval.reason,
            Some(CompletionReason::RetriesExhausted {
                retry_count: 1,
                max_retries: 1
            })
        );
    }

    #[test]
    fn test_success_pattern_checked_before_failure_pattern() {
        let criteria = criteria()
            .with_success_pattern(r"(?m)^DONE$")
            .with_failure_pattern(r"(?i)error");
        let mut job = running_job();
        job.output = "compile error fixed\nDONE\n".into();

        let eval = StateMachine::evaluate_completion(&job, &criteria).unwrap();
        assert_eq!(eval.reason, Some(CompletionReason::SuccessPatternMatched));
        assert!(!eval.should_fail);
    }

    #[test]
    fn test_failure_pattern_sees_error_message() {
        let criteria = criteria().with_failure_pattern(r"rate limit");
        let mut job = running_job();
        job.output = "working...".into();
        job.error_message = Some("provider returned rate limit".into());

        let eval = StateMachine::evaluate_completion(&job, &criteria).unwrap();
        assert_eq!(eval.reason, Some(CompletionReason::FailurePatternMatched));
        assert!(eval.should_fail);
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let criteria = criteria().with_success_pattern("[");
        let job = running_job();
        assert!(matches!(
            StateMachine::evaluate_completion(&job, &criteria),
            Err(CoreError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_evaluation_does_not_mutate() {
        let mut job = running_job();
        job.output_tokens = 99_999;
        let before = job.clone();
        let _ = StateMachine::evaluate_completion(&job, &criteria());
        assert_eq!(job, before);
    }

    #[test]
    fn test_reason_display() {
        let reason = CompletionReason::CostLimitReached {
            cost_usd: 2.5,
            limit_usd: 2.0,
        };
        assert_eq!(reason.to_string(), "cost $2.50 reached limit of $2.00");
    }
}

//! Job state machine.
//!
//! The adjacency table in [`StateMachine::allowed_transitions`] is the single
//! definition of legal status changes. Every status write goes through
//! [`StateMachine::try_transition`], which also applies the side effects tied
//! to the target status.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::completion::{self, CompletionEvaluation};
use crate::{CoreError, Job, JobCompletionCriteria, JobStatus};

/// Outcome of a transition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitionResult {
    pub success: bool,
    pub from: JobStatus,
    pub to: JobStatus,
    /// Caller-supplied reason for the change.
    pub reason: Option<String>,
    /// Human-readable description of what happened.
    pub message: String,
}

impl StateTransitionResult {
    fn applied(from: JobStatus, to: JobStatus, reason: Option<&str>) -> Self {
        let message = match reason {
            Some(r) => format!("{from} -> {to}: {r}"),
            None => format!("{from} -> {to}"),
        };
        Self {
            success: true,
            from,
            to,
            reason: reason.map(str::to_string),
            message,
        }
    }

    fn rejected(from: JobStatus, to: JobStatus, reason: Option<&str>) -> Self {
        let message = match reason {
            Some(r) => format!("transition {from} -> {to} is not allowed (requested: {r})"),
            None => format!("transition {from} -> {to} is not allowed"),
        };
        Self {
            success: false,
            from,
            to,
            reason: reason.map(str::to_string),
            message,
        }
    }

    /// A failed result for a job that could not be loaded.
    pub fn not_found(to: JobStatus, job_id: &str) -> Self {
        Self {
            success: false,
            from: to,
            to,
            reason: None,
            message: format!("job {job_id} not found"),
        }
    }

    /// Convert into a `Result` for callers that prefer `?`.
    pub fn into_result(self) -> Result<(), CoreError> {
        if self.success {
            Ok(())
        } else {
            Err(CoreError::InvalidStateTransition {
                from: self.from,
                to: self.to,
            })
        }
    }
}

/// Validates and applies job status transitions.
pub struct StateMachine;

impl StateMachine {
    /// Statuses reachable from `from` in one step.
    ///
    /// The `Paused` edges model an external pause request; a paused job can
    /// only resume into `Processing`.
    pub fn allowed_transitions(from: JobStatus) -> &'static [JobStatus] {
        use JobStatus::*;
        match from {
            New => &[Pending, Started, Cancelled],
            Pending => &[Started, Cancelled, New],
            Started => &[Processing, Completed, Failed, Cancelled, Stalled, New, Paused],
            Processing => &[Completed, Failed, Cancelled, Stalled, Started, New, Paused],
            Stalled => &[New, Failed, Cancelled],
            Paused => &[Processing],
            Completed => &[New],
            Failed => &[New],
            Cancelled => &[New],
        }
    }

    /// Same-state is always legal; otherwise the adjacency table decides.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        from == to || Self::allowed_transitions(from).contains(&to)
    }

    /// Attempt to move `job` to `new_status`.
    ///
    /// On success the status and its side effects are written together. On
    /// failure the job is left untouched.
    pub fn try_transition(
        job: &mut Job,
        new_status: JobStatus,
        reason: Option<&str>,
    ) -> StateTransitionResult {
        let from = job.status;
        if !Self::can_transition(from, new_status) {
            return StateTransitionResult::rejected(from, new_status, reason);
        }

        job.status = new_status;
        Self::apply_side_effects(job, new_status);

        StateTransitionResult::applied(from, new_status, reason)
    }

    fn apply_side_effects(job: &mut Job, status: JobStatus) {
        let now = Utc::now();
        match status {
            JobStatus::Started => {
                job.started_at.get_or_insert(now);
                job.last_activity_at = Some(now);
                job.last_heartbeat_at = Some(now);
            }
            JobStatus::Processing => {
                job.last_activity_at = Some(now);
                job.last_heartbeat_at = Some(now);
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                job.completed_at = Some(now);
                job.current_activity = None;
                job.worker_id = None;
                job.process_id = None;
            }
            JobStatus::Stalled | JobStatus::Paused => {
                job.last_activity_at = Some(now);
            }
            JobStatus::New => {
                // Token, cost and output history survive a reset.
                job.started_at = None;
                job.completed_at = None;
                job.last_activity_at = None;
                job.last_heartbeat_at = None;
                job.current_activity = None;
                job.worker_id = None;
                job.process_id = None;
                job.cancellation_requested = false;
            }
            JobStatus::Pending => {}
        }
    }

    pub fn is_terminal_state(status: JobStatus) -> bool {
        status.is_terminal()
    }

    pub fn is_active_state(status: JobStatus) -> bool {
        status.is_active()
    }

    pub fn is_waiting_state(status: JobStatus) -> bool {
        status.is_waiting()
    }

    /// Whether a cancel request can be honored from `status`.
    pub fn can_cancel(status: JobStatus) -> bool {
        Self::allowed_transitions(status).contains(&JobStatus::Cancelled)
    }

    /// Whether a job in `status` is eligible to be reset for another attempt.
    pub fn can_retry(status: JobStatus) -> bool {
        matches!(
            status,
            JobStatus::Failed | JobStatus::Stalled | JobStatus::Cancelled
        )
    }

    /// Evaluate `job` against `criteria` at the current time.
    ///
    /// Never mutates the job. Fails only when a criteria pattern is malformed.
    pub fn evaluate_completion(
        job: &Job,
        criteria: &JobCompletionCriteria,
    ) -> Result<CompletionEvaluation, CoreError> {
        completion::evaluate(job, criteria, Utc::now())
    }

    /// Like [`evaluate_completion`](Self::evaluate_completion) with an explicit clock.
    pub fn evaluate_completion_at(
        job: &Job,
        criteria: &JobCompletionCriteria,
        now: chrono::DateTime<Utc>,
    ) -> Result<CompletionEvaluation, CoreError> {
        completion::evaluate(job, criteria, now)
    }
}

//! Job lifecycle service - persisted status changes.
//!
//! Loads a job, runs it through the state machine, saves it, and publishes
//! the outcome. Validation failures come back as unsuccessful
//! [`StateTransitionResult`]s.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobrelay_core::{
    CompletionEvaluation, CoreError, DispatchEvent, Job, JobCompletionCriteria, JobId, JobStatus,
    StateMachine, StateTransitionResult,
};

use crate::coordinator::{cancellable, CoordinatorError};
use crate::notify::{NoopNotifier, NotificationSink};
use crate::store::JobStore;

pub struct JobLifecycle {
    jobs: Arc<dyn JobStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl JobLifecycle {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self {
            jobs,
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Persist a freshly built job. Only jobs in status `New` are accepted.
    pub async fn create_job(&self, job: Job, cancel: &CancellationToken) -> Result<Job, CoordinatorError> {
        if job.status() != JobStatus::New {
            return Err(CoreError::InvalidInput(format!(
                "job {} must be created in status new, not {}",
                job.id,
                job.status()
            ))
            .into());
        }

        cancellable(cancel, self.jobs.save_job(&job)).await?;

        info!(job_id = %job.id, project_id = %job.project_id, "Job created");
        self.notifier
            .publish(DispatchEvent::job_created(job.id.clone(), job.project_id.clone()));
        Ok(job)
    }

    /// Load, transition and save a job.
    ///
    /// A missing job or an illegal transition yields an unsuccessful result.
    pub async fn transition_job(
        &self,
        job_id: &JobId,
        status: JobStatus,
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<StateTransitionResult, CoordinatorError> {
        let Some(mut job) = cancellable(cancel, self.jobs.get_job(job_id)).await? else {
            warn!(job_id = %job_id, to = %status, "Cannot transition - job not found");
            return Ok(StateTransitionResult::not_found(status, job_id.as_str()));
        };
        self.apply(&mut job, status, reason, cancel).await
    }

    /// Transition an already-loaded job and save it on success.
    pub async fn apply(
        &self,
        job: &mut Job,
        status: JobStatus,
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<StateTransitionResult, CoordinatorError> {
        let result = StateMachine::try_transition(job, status, reason);
        if !result.success {
            debug!(job_id = %job.id, message = %result.message, "Transition rejected");
            return Ok(result);
        }

        cancellable(cancel, self.jobs.save_job(job)).await?;

        if result.from != result.to {
            info!(
                job_id = %job.id,
                from = %result.from,
                to = %result.to,
                reason = reason.unwrap_or(""),
                "Job status changed"
            );
            self.notifier.publish(DispatchEvent::status_changed(
                job.id.clone(),
                result.from,
                result.to,
                result.reason.clone(),
            ));
        }
        Ok(result)
    }

    /// Flag a job for cancellation and cancel it if its status allows.
    ///
    /// The flag is persisted even when the job cannot be cancelled yet, so a
    /// running executor can observe it.
    pub async fn request_cancellation(
        &self,
        job_id: &JobId,
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<StateTransitionResult, CoordinatorError> {
        let Some(mut job) = cancellable(cancel, self.jobs.get_job(job_id)).await? else {
            return Ok(StateTransitionResult::not_found(JobStatus::Cancelled, job_id.as_str()));
        };

        job.cancellation_requested = true;
        if StateMachine::can_cancel(job.status()) {
            return self.apply(&mut job, JobStatus::Cancelled, reason, cancel).await;
        }

        cancellable(cancel, self.jobs.save_job(&job)).await?;
        warn!(job_id = %job_id, status = %job.status(), "Cancellation recorded but not applicable yet");
        Ok(StateMachine::try_transition(&mut job, JobStatus::Cancelled, reason))
    }

    /// Evaluate a stored job against `criteria`. `Ok(None)` if it does not exist.
    pub async fn evaluate_job(
        &self,
        job_id: &JobId,
        criteria: &JobCompletionCriteria,
        cancel: &CancellationToken,
    ) -> Result<Option<CompletionEvaluation>, CoordinatorError> {
        let Some(job) = cancellable(cancel, self.jobs.get_job(job_id)).await? else {
            return Ok(None);
        };
        Ok(Some(StateMachine::evaluate_completion(&job, criteria)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastNotifier;
    use crate::store::InMemoryStore;
    use jobrelay_core::{CompletionReason, DispatchEventKind};

    fn lifecycle() -> (Arc<InMemoryStore>, JobLifecycle, CancellationToken) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), JobLifecycle::new(store), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_create_and_transition_publishes_events() {
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(BroadcastNotifier::new(16));
        let mut rx = notifier.subscribe();
        let lifecycle = JobLifecycle::new(store.clone()).with_notifier(notifier);
        let cancel = CancellationToken::new();

        let job = lifecycle
            .create_job(Job::new("proj", "t", "p"), &cancel)
            .await
            .unwrap();
        let result = lifecycle
            .transition_job(&job.id, JobStatus::Started, Some("picked up"), &cancel)
            .await
            .unwrap();
        assert!(result.success);

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Started);
        assert!(stored.started_at.is_some());

        assert!(matches!(rx.recv().await.unwrap().kind, DispatchEventKind::JobCreated { .. }));
        match rx.recv().await.unwrap().kind {
            DispatchEventKind::StatusChanged { from, to, reason, .. } => {
                assert_eq!((from, to), (JobStatus::New, JobStatus::Started));
                assert_eq!(reason.as_deref(), Some("picked up"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_non_new_job() {
        let (_, lifecycle, cancel) = lifecycle();
        let mut job = Job::new("proj", "t", "p");
        StateMachine::try_transition(&mut job, JobStatus::Pending, None);

        let err = lifecycle.create_job(job, &cancel).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Core(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_illegal_transition_is_not_saved() {
        let (store, lifecycle, cancel) = lifecycle();
        let job = lifecycle
            .create_job(Job::new("proj", "t", "p"), &cancel)
            .await
            .unwrap();

        let result = lifecycle
            .transition_job(&job.id, JobStatus::Completed, None, &cancel)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(
            store.get_job(&job.id).await.unwrap().unwrap().status(),
            JobStatus::New
        );

        let missing = lifecycle
            .transition_job(&JobId::new("nope"), JobStatus::Started, None, &cancel)
            .await
            .unwrap();
        assert!(!missing.success);
        assert!(missing.message.contains("not found"));
    }

    #[tokio::test]
    async fn test_request_cancellation() {
        let (store, lifecycle, cancel) = lifecycle();
        let waiting = lifecycle
            .create_job(Job::new("a", "t", "p"), &cancel)
            .await
            .unwrap();
        let result = lifecycle
            .request_cancellation(&waiting.id, Some("user"), &cancel)
            .await
            .unwrap();
        assert!(result.success);
        let stored = store.get_job(&waiting.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Cancelled);
        assert!(stored.cancellation_requested);

        // Paused jobs cannot be cancelled directly; the flag still sticks.
        let paused = lifecycle
            .create_job(Job::new("b", "t", "p"), &cancel)
            .await
            .unwrap();
        lifecycle
            .transition_job(&paused.id, JobStatus::Started, None, &cancel)
            .await
            .unwrap();
        lifecycle
            .transition_job(&paused.id, JobStatus::Paused, None, &cancel)
            .await
            .unwrap();
        let result = lifecycle
            .request_cancellation(&paused.id, None, &cancel)
            .await
            .unwrap();
        assert!(!result.success);
        let stored = store.get_job(&paused.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Paused);
        assert!(stored.cancellation_requested);
    }

    #[tokio::test]
    async fn test_evaluate_job() {
        let (store, lifecycle, cancel) = lifecycle();
        let mut job = Job::new("proj", "t", "p");
        StateMachine::try_transition(&mut job, JobStatus::Started, None);
        job.append_output("all done: SUCCESS");
        store.save_job(&job).await.unwrap();

        let criteria = JobCompletionCriteria::default().with_success_pattern("SUCCESS");
        let evaluation = lifecycle
            .evaluate_job(&job.id, &criteria, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(evaluation.is_complete);
        assert_eq!(evaluation.reason, Some(CompletionReason::SuccessPatternMatched));

        let bad = JobCompletionCriteria::default().with_success_pattern("(");
        let err = lifecycle.evaluate_job(&job.id, &bad, &cancel).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Core(CoreError::InvalidPattern { .. })));

        assert!(lifecycle
            .evaluate_job(&JobId::new("nope"), &criteria, &cancel)
            .await
            .unwrap()
            .is_none());
    }
}

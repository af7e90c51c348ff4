//! Dispatcher - the scheduling loop that drives the coordinator.
//!
//! Each tick rebalances, pulls a batch of assignments, starts every job
//! synchronously so the next tick cannot pick it again, then runs it on a
//! spawned task that reports back to the coordinator when done.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobrelay_core::{Job, JobCompletionCriteria, JobId, JobStatus, StateMachine};

use crate::config::DispatcherConfig;
use crate::coordinator::{cancellable, Coordinator, CoordinatorError, JobAssignment};
use crate::executor::ProviderExecutor;
use crate::lifecycle::JobLifecycle;
use crate::store::PendingJobQueue;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub rebalanced: usize,
    pub assigned: usize,
}

/// Totals over a [`Dispatcher::run_until_idle`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub ticks: usize,
    pub assigned: usize,
    pub rebalanced: usize,
    pub selection_timeouts: usize,
}

/// Shared pieces a running job task needs.
#[derive(Clone)]
struct Runner {
    coordinator: Arc<Coordinator>,
    lifecycle: Arc<JobLifecycle>,
    executor: Arc<dyn ProviderExecutor>,
    criteria: JobCompletionCriteria,
}

pub struct Dispatcher {
    runner: Runner,
    queue: Arc<dyn PendingJobQueue>,
    config: DispatcherConfig,
    tasks: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(
        coordinator: Arc<Coordinator>,
        lifecycle: Arc<JobLifecycle>,
        queue: Arc<dyn PendingJobQueue>,
        executor: Arc<dyn ProviderExecutor>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            runner: Runner {
                coordinator,
                lifecycle,
                executor,
                criteria: JobCompletionCriteria::default(),
            },
            queue,
            config,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Builder method to set the completion criteria applied to every job.
    pub fn with_criteria(mut self, criteria: JobCompletionCriteria) -> Self {
        self.runner.criteria = criteria;
        self
    }

    /// Number of jobs currently executing.
    pub async fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        reap(&mut tasks);
        tasks.len()
    }

    /// Run one scheduling pass.
    ///
    /// Selection is bounded by the coordinator's selection timeout. On timeout
    /// the batch is cancelled, which rolls back its load increments.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickSummary, CoordinatorError> {
        let coordinator = &self.runner.coordinator;
        let rebalanced = coordinator.rebalance_jobs(cancel).await?;

        let timeout = coordinator.config().provider_selection_timeout();
        let selection_cancel = cancel.child_token();
        let selection =
            coordinator.get_next_job_assignments(self.config.max_jobs_per_tick, &selection_cancel);
        tokio::pin!(selection);

        let assignments = tokio::select! {
            result = &mut selection => result?,
            _ = tokio::time::sleep(timeout) => {
                selection_cancel.cancel();
                match selection.await {
                    Err(CoordinatorError::Cancelled) if !cancel.is_cancelled() => {
                        warn!(timeout_secs = timeout.as_secs(), "Provider selection timed out");
                        return Err(CoordinatorError::SelectionTimedOut(timeout));
                    }
                    other => other?,
                }
            }
        };

        let mut assigned = 0;
        for assignment in assignments {
            match self.start(&assignment, cancel).await {
                Ok(Some(job)) => {
                    let runner = self.runner.clone();
                    let cancel = cancel.clone();
                    self.tasks
                        .lock()
                        .await
                        .spawn(async move { runner.run(job, assignment, cancel).await });
                    assigned += 1;
                }
                Ok(None) => coordinator.abandon_assignment(&assignment).await,
                Err(e) => {
                    coordinator.abandon_assignment(&assignment).await;
                    warn!(job_id = %assignment.job.id, error = %e, "Failed to start assigned job");
                }
            }
        }

        if rebalanced > 0 || assigned > 0 {
            info!(rebalanced, assigned, "Dispatch tick");
        }
        Ok(TickSummary {
            rebalanced,
            assigned,
        })
    }

    /// Bind the provider and move the job to `Started`.
    ///
    /// Returns `None` if the job vanished, was cancelled, or can no longer start.
    async fn start(
        &self,
        assignment: &JobAssignment,
        cancel: &CancellationToken,
    ) -> Result<Option<Job>, CoordinatorError> {
        let Some(mut job) = self.runner.load_job(&assignment.job.id, cancel).await? else {
            return Ok(None);
        };
        if job.cancellation_requested || !job.status().is_waiting() {
            debug!(job_id = %job.id, status = %job.status(), "Skipping assignment - job no longer waiting");
            return Ok(None);
        }

        let provider = &assignment.provider;
        job.provider_id = Some(provider.id.clone());
        job.worker_id = Some(format!("{}/{}", provider.kind, provider.id));

        let reason = format!("assigned to {}", provider.name);
        let result = self
            .runner
            .lifecycle
            .apply(&mut job, JobStatus::Started, Some(&reason), cancel)
            .await?;
        Ok(result.success.then_some(job))
    }

    /// Tick until nothing is pending or running, or `cancel` fires.
    ///
    /// Waits for in-flight jobs before returning.
    pub async fn run_until_idle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DispatchSummary, CoordinatorError> {
        let mut summary = DispatchSummary::default();

        while !cancel.is_cancelled() {
            summary.ticks += 1;
            match self.tick(cancel).await {
                Ok(tick) => {
                    summary.assigned += tick.assigned;
                    summary.rebalanced += tick.rebalanced;
                }
                Err(CoordinatorError::SelectionTimedOut(_)) => summary.selection_timeouts += 1,
                Err(CoordinatorError::Cancelled) => break,
                Err(e) => return Err(e),
            }

            let pending = self.queue.get_pending_jobs(1).await?;
            if pending.is_empty() && self.in_flight().await == 0 {
                debug!(ticks = summary.ticks, "Dispatcher idle");
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick_interval()) => {}
            }
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task panicked");
            }
        }

        info!(
            ticks = summary.ticks,
            assigned = summary.assigned,
            rebalanced = summary.rebalanced,
            "Dispatcher stopped"
        );
        Ok(summary)
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            error!(error = %e, "Job task panicked");
        }
    }
}

impl Runner {
    async fn load_job(
        &self,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<Option<Job>, CoordinatorError> {
        cancellable(cancel, self.coordinator.job_store().get_job(job_id)).await
    }

    async fn run(self, mut job: Job, assignment: JobAssignment, cancel: CancellationToken) {
        let provider = assignment.provider.clone();
        match self.execute(&mut job, &assignment, &cancel).await {
            Ok(success) => {
                self.coordinator
                    .release_job_from_provider(&job.id, &provider.id, success, &cancel)
                    .await;
                if !success {
                    self.retry(&mut job, &cancel).await;
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, provider_id = %provider.id, error = %e, "Job run aborted");
                self.settle_aborted(&job.id, &e).await;
                self.coordinator.abandon_assignment(&assignment).await;
            }
        }
    }

    /// Fail a job whose run was cut short so it does not stay active.
    ///
    /// Runs on a fresh token: the run's own token may be what aborted it.
    /// A job that already left its active status is left alone.
    async fn settle_aborted(&self, job_id: &JobId, cause: &CoordinatorError) {
        let settle = CancellationToken::new();
        let mut job = match self.load_job(job_id, &settle).await {
            Ok(Some(job)) if job.status().is_active() => job,
            Ok(_) => return,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Could not reload aborted job");
                return;
            }
        };

        let reason = format!("run aborted: {cause}");
        job.error_message = Some(reason.clone());
        match self
            .lifecycle
            .apply(&mut job, JobStatus::Failed, Some(&reason), &settle)
            .await
        {
            Ok(result) if result.success => {}
            Ok(result) => warn!(job_id = %job_id, message = %result.message, "Could not fail aborted job"),
            Err(e) => error!(job_id = %job_id, error = %e, "Could not fail aborted job"),
        }
    }

    /// Execute and move the job to a terminal status. Returns the outcome.
    async fn execute(
        &self,
        job: &mut Job,
        assignment: &JobAssignment,
        cancel: &CancellationToken,
    ) -> Result<bool, CoordinatorError> {
        self.lifecycle
            .apply(job, JobStatus::Processing, None, cancel)
            .await?;

        let report = tokio::select! {
            _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
            report = self.executor.execute(job, &assignment.provider) => report,
        };

        job.record_usage(report.input_tokens, report.output_tokens, report.cost_usd);
        job.append_output(&report.output);
        job.record_heartbeat();
        if let Some(activity) = &report.activity {
            job.record_activity(activity.clone());
        }
        if let Some(error) = &report.error {
            job.error_message = Some(error.clone());
        }

        let (success, reason) = match StateMachine::evaluate_completion(job, &self.criteria) {
            Ok(evaluation) => {
                let failed = !report.is_success() || evaluation.should_fail || evaluation.should_retry;
                let reason = evaluation.reason.map(|r| r.to_string());
                (!failed, reason)
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Completion criteria invalid - failing job");
                job.error_message.get_or_insert_with(|| e.to_string());
                (false, Some(e.to_string()))
            }
        };

        let target = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let reason = reason.or_else(|| job.error_message.clone());
        let result = self
            .lifecycle
            .apply(job, target, reason.as_deref(), cancel)
            .await?;
        if !result.success {
            warn!(job_id = %job.id, message = %result.message, "Could not finish job");
        }
        Ok(success)
    }

    /// Reset a failed job for another attempt if it has retries left.
    async fn retry(&self, job: &mut Job, cancel: &CancellationToken) {
        if !job.retries_remaining() || !StateMachine::can_retry(job.status()) {
            info!(
                job_id = %job.id,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                "Job failed permanently"
            );
            return;
        }

        job.retry_count += 1;
        job.provider_id = None;
        let reason = format!("retry {}/{}", job.retry_count, job.max_retries);
        if let Err(e) = self
            .lifecycle
            .apply(job, JobStatus::New, Some(&reason), cancel)
            .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to reset job for retry");
        }
    }
}

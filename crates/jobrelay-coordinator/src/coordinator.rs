//! Coordinator - routes jobs to providers.
//!
//! Selection and assignment run under one coordinator-wide lock because
//! capacity decisions read and then write load counters across providers.
//! The health tracker's per-provider locks sit underneath it and are never
//! held across the coordinator lock's await points by callers outside.
//!
//! Each job counts against at most one provider's load at a time. The
//! coordinator remembers which provider that is, so a job bound by
//! [`Coordinator::assign_job_to_provider`] and later picked up by a batch
//! is not counted twice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobrelay_core::{CoreError, DispatchEvent, Job, JobId, JobStatus, Provider, ProviderId};

use crate::config::CoordinatorConfig;
use crate::health::{HealthTracker, ProviderHealth};
use crate::notify::{NoopNotifier, NotificationSink};
use crate::store::{JobStore, PendingJobQueue, ProviderStore, StoreError};

/// Coordinator errors.
///
/// Validation outcomes are not errors; they come back as `Ok(false)` or
/// `Ok(None)`.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Provider selection timed out after {0:?}")]
    SelectionTimedOut(Duration),
}

/// What a batch did to the load count of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reservation {
    /// The job was not counted anywhere; the batch counted it.
    Added,
    /// The job was already counted on the selected provider.
    Held,
    /// The job's count moved here from another provider.
    MovedFrom(ProviderId),
}

/// A provisional job/provider pairing produced by batch selection.
#[derive(Debug, Clone)]
pub struct JobAssignment {
    pub job: Job,
    pub provider: Provider,
    pub assigned_at: DateTime<Utc>,
    reservation: Reservation,
}

impl JobAssignment {
    pub fn new(job: Job, provider: Provider) -> Self {
        Self::reserved(job, provider, Reservation::Added)
    }

    fn reserved(job: Job, provider: Provider, reservation: Reservation) -> Self {
        Self {
            job,
            provider,
            assigned_at: Utc::now(),
            reservation,
        }
    }
}

/// Score a provider from 0 upward; higher is better.
///
/// Starts at 100 and subtracts up to 40 for load, up to 30 for recent
/// failure rate and up to 20 for average response time (capped at 10s),
/// then adds up to 10 as the last failure recedes (capped at 24h). Only the
/// lower bound is clamped.
pub fn score_provider(health: &ProviderHealth, max_jobs_per_provider: u32) -> f64 {
    let capacity = f64::from(max_jobs_per_provider.max(1));
    let load_ratio = (f64::from(health.current_load) / capacity).min(1.0);

    let mut score = 100.0;
    score -= 40.0 * load_ratio;
    score -= 30.0 * health.recent_failure_rate.clamp(0.0, 1.0);

    if let Some(avg) = health.average_response_time {
        score -= 20.0 * avg.as_secs_f64().min(10.0) / 10.0;
    }

    let hours_since_failure = health
        .time_since_last_failure
        .map_or(24.0, |d| (d.as_secs_f64() / 3600.0).min(24.0));
    score += 10.0 * hours_since_failure / 24.0;

    score.max(0.0)
}

/// Race a store call against `cancel`.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, CoordinatorError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CoordinatorError::Cancelled),
        result = fut => Ok(result?),
    }
}

/// Provider selection and assignment bookkeeping.
pub struct Coordinator {
    jobs: Arc<dyn JobStore>,
    providers: Arc<dyn ProviderStore>,
    queue: Arc<dyn PendingJobQueue>,
    health: Arc<HealthTracker>,
    notifier: Arc<dyn NotificationSink>,
    config: CoordinatorConfig,
    selection_lock: Mutex<()>,
    /// Provider each job currently counts against.
    counted: Mutex<HashMap<JobId, ProviderId>>,
}

impl Coordinator {
    /// Create a new Coordinator from its collaborators.
    pub fn new(
        jobs: Arc<dyn JobStore>,
        providers: Arc<dyn ProviderStore>,
        queue: Arc<dyn PendingJobQueue>,
        health: Arc<HealthTracker>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            jobs,
            providers,
            queue,
            health,
            notifier: Arc::new(NoopNotifier),
            config,
            selection_lock: Mutex::new(()),
            counted: Mutex::new(HashMap::new()),
        }
    }

    /// Create a Coordinator over a single store implementing every trait.
    pub fn from_store<S>(store: Arc<S>, health: Arc<HealthTracker>, config: CoordinatorConfig) -> Self
    where
        S: JobStore + ProviderStore + PendingJobQueue + 'static,
    {
        Self::new(store.clone(), store.clone(), store, health, config)
    }

    /// Builder method to publish assignment events.
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, ()>, CoordinatorError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoordinatorError::Cancelled),
            guard = self.selection_lock.lock() => Ok(guard),
        }
    }

    /// Healthy and under the load cap. Unreadable health counts as unusable.
    ///
    /// With `holds_slot` the job already counts against this provider, so its
    /// own slot is left out of the returned load and the capacity check.
    async fn usable_health(
        &self,
        provider_id: &ProviderId,
        holds_slot: bool,
    ) -> Option<ProviderHealth> {
        let mut health = self.health.try_get_provider_health(provider_id).await?;
        health.current_load = health.current_load.saturating_sub(u32::from(holds_slot));
        (health.is_healthy && health.current_load < self.config.max_jobs_per_provider)
            .then_some(health)
    }

    async fn counted_provider(&self, job_id: &JobId) -> Option<ProviderId> {
        self.counted.lock().await.get(job_id).cloned()
    }

    /// Count `job_id` against `provider_id`, moving an existing count if the
    /// job was counted elsewhere.
    async fn reserve(&self, job_id: &JobId, provider_id: &ProviderId) -> Reservation {
        let mut counted = self.counted.lock().await;
        match counted.insert(job_id.clone(), provider_id.clone()) {
            Some(previous) if previous == *provider_id => Reservation::Held,
            Some(previous) => {
                self.health.decrement_provider_load(&previous).await;
                self.health.increment_provider_load(provider_id).await;
                Reservation::MovedFrom(previous)
            }
            None => {
                self.health.increment_provider_load(provider_id).await;
                Reservation::Added
            }
        }
    }

    /// Undo the reservations of a batch that did not complete.
    async fn roll_back(&self, assignments: &[JobAssignment]) {
        let mut counted = self.counted.lock().await;
        for assignment in assignments.iter().rev() {
            let (job_id, provider_id) = (&assignment.job.id, &assignment.provider.id);
            match &assignment.reservation {
                Reservation::Held => continue,
                Reservation::Added => {
                    counted.remove(job_id);
                    self.health.decrement_provider_load(provider_id).await;
                }
                Reservation::MovedFrom(previous) => {
                    counted.insert(job_id.clone(), previous.clone());
                    self.health.decrement_provider_load(provider_id).await;
                    self.health.increment_provider_load(previous).await;
                }
            }
            debug!(job_id = %job_id, provider_id = %provider_id, "Rolled back reservation");
        }
    }

    /// Pick the best provider for `job`, or `None` if none qualifies.
    pub async fn select_provider_for_job(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Option<Provider>, CoordinatorError> {
        let _guard = self.lock(cancel).await?;
        self.select_locked(job, cancel).await
    }

    async fn select_locked(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Option<Provider>, CoordinatorError> {
        let counted_on = self.counted_provider(&job.id).await;

        if let Some(preferred) = &job.provider_id {
            match cancellable(cancel, self.providers.get_provider(preferred)).await? {
                Some(provider) if provider.enabled => {
                    let holds_slot = counted_on.as_ref() == Some(preferred);
                    if self.usable_health(preferred, holds_slot).await.is_some() {
                        return Ok(Some(provider));
                    }
                    warn!(
                        job_id = %job.id,
                        provider_id = %preferred,
                        "Preferred provider unhealthy or at capacity - selecting another"
                    );
                }
                _ => warn!(
                    job_id = %job.id,
                    provider_id = %preferred,
                    "Preferred provider missing or disabled - selecting another"
                ),
            }
        }

        let providers = cancellable(cancel, self.providers.list_enabled_providers()).await?;

        let mut best: Option<(f64, Provider)> = None;
        for provider in providers {
            let holds_slot = counted_on.as_ref() == Some(&provider.id);
            let Some(health) = self.usable_health(&provider.id, holds_slot).await else {
                debug!(provider_id = %provider.id, "Skipping unhealthy or saturated provider");
                continue;
            };

            let score = score_provider(&health, self.config.max_jobs_per_provider);
            debug!(
                provider_id = %provider.id,
                score,
                load = health.current_load,
                failure_rate = health.recent_failure_rate,
                "Scored provider"
            );

            if best.as_ref().map_or(true, |(top, _)| score > *top) {
                best = Some((score, provider));
            }
        }

        Ok(best.map(|(_, provider)| provider))
    }

    /// Bind `job_id` to `provider_id` and count it against the provider's load.
    ///
    /// Returns `Ok(false)` when the job or provider is missing, or the
    /// provider is disabled, unhealthy or at capacity. Re-assigning a job to
    /// the provider it already counts against changes no load.
    pub async fn assign_job_to_provider(
        &self,
        job_id: &JobId,
        provider_id: &ProviderId,
        cancel: &CancellationToken,
    ) -> Result<bool, CoordinatorError> {
        let _guard = self.lock(cancel).await?;

        let Some(mut job) = cancellable(cancel, self.jobs.get_job(job_id)).await? else {
            warn!(job_id = %job_id, "Cannot assign - job not found");
            return Ok(false);
        };

        match cancellable(cancel, self.providers.get_provider(provider_id)).await? {
            Some(provider) if provider.enabled => {}
            Some(_) => {
                warn!(provider_id = %provider_id, "Cannot assign - provider disabled");
                return Ok(false);
            }
            None => {
                warn!(provider_id = %provider_id, "Cannot assign - provider not found");
                return Ok(false);
            }
        }

        let holds_slot = self.counted_provider(job_id).await.as_ref() == Some(provider_id);
        if self.usable_health(provider_id, holds_slot).await.is_none() {
            warn!(
                job_id = %job_id,
                provider_id = %provider_id,
                "Cannot assign - provider unhealthy or at capacity"
            );
            return Ok(false);
        }

        job.provider_id = Some(provider_id.clone());
        cancellable(cancel, self.jobs.save_job(&job)).await?;

        // No await on a cancellable future after this point.
        let reservation = self.reserve(job_id, provider_id).await;

        info!(
            job_id = %job_id,
            provider_id = %provider_id,
            reservation = ?reservation,
            "Assigned job to provider"
        );
        self.notifier
            .publish(DispatchEvent::job_assigned(job_id.clone(), provider_id.clone()));

        Ok(true)
    }

    /// Release a finished job: drop its load and record the outcome.
    ///
    /// Best effort. Lookup failures are logged and the bookkeeping still runs.
    /// The load comes off whichever provider the job counts against, falling
    /// back to `provider_id`; the outcome is always recorded on `provider_id`.
    pub async fn release_job_from_provider(
        &self,
        job_id: &JobId,
        provider_id: &ProviderId,
        success: bool,
        cancel: &CancellationToken,
    ) {
        let load = {
            let mut counted = self.counted.lock().await;
            let holder = counted.remove(job_id).unwrap_or_else(|| provider_id.clone());
            self.health.decrement_provider_load(&holder).await
        };

        let (response_time, error) = match cancellable(cancel, self.jobs.get_job(job_id)).await {
            Ok(Some(job)) => {
                let response_time = job
                    .started_at
                    .zip(job.completed_at)
                    .and_then(|(start, end)| (end - start).to_std().ok());
                (response_time, job.error_message)
            }
            Ok(None) => (None, None),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Release lookup failed - recording outcome without timing");
                (None, None)
            }
        };

        if success {
            self.health.record_success(provider_id, response_time).await;
        } else {
            self.health
                .record_failure(provider_id, error.as_deref(), response_time)
                .await;
        }

        info!(
            job_id = %job_id,
            provider_id = %provider_id,
            success,
            load,
            "Released job from provider"
        );
        self.notifier.publish(DispatchEvent::job_released(
            job_id.clone(),
            provider_id.clone(),
            success,
        ));
    }

    /// Drop the load of an assignment that will not run.
    ///
    /// Clears the job's count wherever it was made, including a count from
    /// an earlier [`Coordinator::assign_job_to_provider`]. Records no health
    /// outcome and is a no-op for a job that no longer counts anywhere.
    pub async fn abandon_assignment(&self, assignment: &JobAssignment) {
        let mut counted = self.counted.lock().await;
        let Some(holder) = counted.remove(&assignment.job.id) else {
            return;
        };
        let load = self.health.decrement_provider_load(&holder).await;
        debug!(
            job_id = %assignment.job.id,
            provider_id = %holder,
            load,
            "Abandoned assignment"
        );
    }

    /// Pull up to `max_jobs` ready-to-run (job, provider) pairs.
    ///
    /// Each pick counts the job against its provider so later picks in the
    /// same batch see the load. A job that already counts against the picked
    /// provider is not counted again. On cancellation the batch's own
    /// reservations are rolled back.
    pub async fn get_next_job_assignments(
        &self,
        max_jobs: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<JobAssignment>, CoordinatorError> {
        if max_jobs == 0 {
            return Ok(Vec::new());
        }

        let limit = max_jobs.saturating_mul(self.config.candidate_overfetch.max(1));
        let candidates = cancellable(cancel, self.queue.get_pending_jobs(limit)).await?;

        let _guard = self.lock(cancel).await?;

        let mut assignments: Vec<JobAssignment> = Vec::with_capacity(max_jobs);
        for job in candidates {
            if assignments.len() >= max_jobs {
                break;
            }

            match self.select_locked(&job, cancel).await {
                Ok(Some(provider)) => {
                    let reservation = self.reserve(&job.id, &provider.id).await;
                    debug!(
                        job_id = %job.id,
                        provider_id = %provider.id,
                        reservation = ?reservation,
                        "Selected provider for pending job"
                    );
                    assignments.push(JobAssignment::reserved(job, provider, reservation));
                }
                Ok(None) => {
                    debug!(job_id = %job.id, "No provider available - job stays pending");
                }
                Err(e) => {
                    self.roll_back(&assignments).await;
                    return Err(e);
                }
            }
        }

        if !assignments.is_empty() {
            info!(count = assignments.len(), requested = max_jobs, "Collected job assignments");
        }
        Ok(assignments)
    }

    /// Move not-yet-started jobs off providers that became unhealthy.
    ///
    /// Returns the number of jobs reassigned. Running jobs are never moved.
    pub async fn rebalance_jobs(&self, cancel: &CancellationToken) -> Result<usize, CoordinatorError> {
        let waiting = cancellable(
            cancel,
            self.jobs.list_jobs(&[JobStatus::New, JobStatus::Pending]),
        )
        .await?;

        let _guard = self.lock(cancel).await?;

        let mut moved = 0;
        for mut job in waiting {
            let Some(current) = job.provider_id.clone() else {
                continue;
            };
            if self.health.is_provider_healthy(&current).await {
                continue;
            }

            let mut unbound = job.clone();
            unbound.provider_id = None;
            match self.select_locked(&unbound, cancel).await? {
                Some(provider) if provider.id != current => {
                    job.provider_id = Some(provider.id.clone());
                    cancellable(cancel, self.jobs.save_job(&job)).await?;

                    // A binding that was never counted stays uncounted.
                    let mut counted = self.counted.lock().await;
                    if counted.get(&job.id) == Some(&current) {
                        counted.insert(job.id.clone(), provider.id.clone());
                        self.health.decrement_provider_load(&current).await;
                        self.health.increment_provider_load(&provider.id).await;
                    }
                    drop(counted);

                    info!(
                        job_id = %job.id,
                        from = %current,
                        to = %provider.id,
                        "Rebalanced job to healthier provider"
                    );
                    self.notifier.publish(DispatchEvent::job_reassigned(
                        job.id.clone(),
                        current,
                        provider.id,
                    ));
                    moved += 1;
                }
                _ => {
                    debug!(job_id = %job.id, provider_id = %current, "No healthier provider for job");
                }
            }
        }

        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::notify::BroadcastNotifier;
    use crate::store::testing::SlowListing;
    use crate::store::InMemoryStore;
    use jobrelay_core::{CircuitState, DispatchEventKind, StateMachine};

    struct Fixture {
        store: Arc<InMemoryStore>,
        coordinator: Coordinator,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(max_jobs_per_provider: u32) -> Self {
            let store = Arc::new(InMemoryStore::new());
            let health = Arc::new(HealthTracker::new(HealthConfig::default()));
            let config = CoordinatorConfig {
                max_jobs_per_provider,
                ..Default::default()
            };
            Self {
                coordinator: Coordinator::from_store(store.clone(), health, config),
                store,
                cancel: CancellationToken::new(),
            }
        }

        async fn provider(&self, id: &str) -> ProviderId {
            let provider = Provider::new(id, id);
            self.store.save_provider(&provider).await.unwrap();
            provider.id
        }

        async fn job(&self, project: &str) -> JobId {
            let job = Job::new(project, "t", "p").with_priority(1);
            self.store.save_job(&job).await.unwrap();
            job.id
        }

        async fn load(&self, id: &ProviderId) -> u32 {
            self.coordinator
                .health()
                .get_provider_health(id)
                .await
                .current_load
        }
    }

    fn health(load: u32, failure_rate: f64) -> ProviderHealth {
        ProviderHealth {
            provider_id: ProviderId::new("p"),
            circuit_state: CircuitState::Closed,
            is_healthy: true,
            current_load: load,
            total_successes: 0,
            total_failures: 0,
            recent_successes: 0,
            recent_failures: 0,
            recent_failure_rate: failure_rate,
            average_response_time: Some(Duration::from_secs(2)),
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            time_since_last_failure: Some(Duration::from_secs(3600)),
            last_error: None,
        }
    }

    #[test]
    fn test_score_monotonic_in_load_and_failure_rate() {
        let mut previous = f64::MAX;
        for load in 0..=6 {
            let score = score_provider(&health(load, 0.1), 4);
            assert!(score <= previous, "load {load}");
            previous = score;
        }

        let mut previous = f64::MAX;
        for step in 0..=10 {
            let score = score_provider(&health(1, f64::from(step) / 10.0), 4);
            assert!(score <= previous, "rate step {step}");
            previous = score;
        }
    }

    #[test]
    fn test_score_components() {
        let mut idle = health(0, 0.0);
        idle.average_response_time = None;
        idle.time_since_last_failure = None;
        assert_eq!(score_provider(&idle, 3), 110.0);

        let mut worst = health(3, 1.0);
        worst.average_response_time = Some(Duration::from_secs(60));
        worst.time_since_last_failure = Some(Duration::ZERO);
        assert_eq!(score_provider(&worst, 3), 10.0);
    }

    #[tokio::test]
    async fn test_batch_never_over_assigns_one_provider() {
        let fx = Fixture::new(2);
        let p = fx.provider("solo").await;
        for i in 0..5 {
            fx.job(&format!("proj-{i}")).await;
        }

        let assignments = fx
            .coordinator
            .get_next_job_assignments(3, &fx.cancel)
            .await
            .unwrap();

        assert_eq!(assignments.len(), 2);
        assert!(assignments.iter().all(|a| a.provider.id == p));
        assert_eq!(fx.load(&p).await, 2);
    }

    #[tokio::test]
    async fn test_batch_fills_capacity_then_waits_for_release() {
        let fx = Fixture::new(3);
        let p = fx.provider("p").await;
        let mut ids = Vec::new();
        for project in ["a", "b", "c"] {
            ids.push(fx.job(project).await);
        }

        let first = fx
            .coordinator
            .get_next_job_assignments(5, &fx.cancel)
            .await
            .unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|a| a.provider.id == p));
        assert_eq!(fx.load(&p).await, 3);

        let second = fx
            .coordinator
            .get_next_job_assignments(5, &fx.cancel)
            .await
            .unwrap();
        assert!(second.is_empty());

        fx.coordinator
            .release_job_from_provider(&ids[0], &p, true, &fx.cancel)
            .await;
        assert_eq!(fx.load(&p).await, 2);

        let third = fx
            .coordinator
            .get_next_job_assignments(5, &fx.cancel)
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn test_select_prefers_less_loaded_and_skips_open_circuit() {
        let fx = Fixture::new(4);
        let a = fx.provider("a").await;
        let b = fx.provider("b").await;
        let c = fx.provider("c").await;
        let job = Job::new("proj", "t", "p");

        fx.coordinator.health().increment_provider_load(&a).await;
        fx.coordinator
            .health()
            .force_circuit_state(&c, CircuitState::Open)
            .await;

        let selected = fx
            .coordinator
            .select_provider_for_job(&job, &fx.cancel)
            .await
            .unwrap();
        assert_eq!(selected.map(|p| p.id), Some(b.clone()));

        fx.coordinator
            .health()
            .force_circuit_state(&b, CircuitState::Open)
            .await;
        for _ in 0..3 {
            fx.coordinator.health().increment_provider_load(&a).await;
        }
        let selected = fx
            .coordinator
            .select_provider_for_job(&job, &fx.cancel)
            .await
            .unwrap();
        assert!(selected.is_none());
    }

    #[tokio::test]
    async fn test_select_honors_usable_preferred_provider() {
        let fx = Fixture::new(4);
        fx.provider("a").await;
        let z = fx.provider("z").await;
        fx.coordinator.health().increment_provider_load(&z).await;

        let job = Job::new("proj", "t", "p").with_provider(z.clone());
        let selected = fx
            .coordinator
            .select_provider_for_job(&job, &fx.cancel)
            .await
            .unwrap();
        assert_eq!(selected.map(|p| p.id), Some(z.clone()));

        fx.store
            .save_provider(&Provider::new("z", "z").disabled())
            .await
            .unwrap();
        let selected = fx
            .coordinator
            .select_provider_for_job(&job, &fx.cancel)
            .await
            .unwrap();
        assert_eq!(selected.map(|p| p.id), Some(ProviderId::new("a")));
    }

    #[tokio::test]
    async fn test_assign_validations() {
        let fx = Fixture::new(1);
        let p = fx.provider("p").await;
        let off = ProviderId::new("off");
        fx.store
            .save_provider(&Provider::new("off", "off").disabled())
            .await
            .unwrap();
        let j1 = fx.job("a").await;
        let j2 = fx.job("b").await;

        let c = &fx.coordinator;
        assert!(!c.assign_job_to_provider(&JobId::new("missing"), &p, &fx.cancel).await.unwrap());
        assert!(!c.assign_job_to_provider(&j1, &ProviderId::new("nope"), &fx.cancel).await.unwrap());
        assert!(!c.assign_job_to_provider(&j1, &off, &fx.cancel).await.unwrap());

        assert!(c.assign_job_to_provider(&j1, &p, &fx.cancel).await.unwrap());
        let stored = fx.store.get_job(&j1).await.unwrap().unwrap();
        assert_eq!(stored.provider_id, Some(p.clone()));
        assert_eq!(fx.load(&p).await, 1);

        // At capacity.
        assert!(!c.assign_job_to_provider(&j2, &p, &fx.cancel).await.unwrap());
        assert_eq!(fx.load(&p).await, 1);

        // The job's own slot does not count against it.
        assert!(c.assign_job_to_provider(&j1, &p, &fx.cancel).await.unwrap());
        assert_eq!(fx.load(&p).await, 1);
    }

    #[tokio::test]
    async fn test_assigned_job_is_counted_once() {
        let fx = Fixture::new(2);
        let p = fx.provider("p").await;
        let j = fx.job("a").await;
        assert!(fx.coordinator.assign_job_to_provider(&j, &p, &fx.cancel).await.unwrap());
        assert_eq!(fx.load(&p).await, 1);

        let batch = fx
            .coordinator
            .get_next_job_assignments(5, &fx.cancel)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].provider.id, p);
        assert_eq!(fx.load(&p).await, 1);

        fx.coordinator
            .release_job_from_provider(&j, &p, true, &fx.cancel)
            .await;
        assert_eq!(fx.load(&p).await, 0);
    }

    #[tokio::test]
    async fn test_assigned_job_dispatches_at_cap_one() {
        let fx = Fixture::new(1);
        let p = fx.provider("p").await;
        let j = fx.job("a").await;
        assert!(fx.coordinator.assign_job_to_provider(&j, &p, &fx.cancel).await.unwrap());

        let batch = fx
            .coordinator
            .get_next_job_assignments(5, &fx.cancel)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].job.id, j);
        assert_eq!(fx.load(&p).await, 1);

        fx.coordinator.abandon_assignment(&batch[0]).await;
        assert_eq!(fx.load(&p).await, 0);
        fx.coordinator.abandon_assignment(&batch[0]).await;
        assert_eq!(fx.load(&p).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_batch_rolls_back_its_reservations() {
        let store = Arc::new(InMemoryStore::new());
        let health = Arc::new(HealthTracker::default());
        let slow = Arc::new(SlowListing::new(store.clone(), 1, Duration::from_secs(10)));
        let coordinator = Coordinator::new(
            store.clone(),
            slow,
            store.clone(),
            health.clone(),
            CoordinatorConfig {
                max_jobs_per_provider: 2,
                ..Default::default()
            },
        );
        let p = ProviderId::new("p");
        store.save_provider(&Provider::new("p", "p")).await.unwrap();

        let held = Job::new("held", "t", "p").with_priority(3);
        let first = Job::new("one", "t", "p").with_priority(2);
        let second = Job::new("two", "t", "p").with_priority(1);
        for job in [&held, &first, &second] {
            store.save_job(job).await.unwrap();
        }
        assert!(coordinator
            .assign_job_to_provider(&held.id, &p, &CancellationToken::new())
            .await
            .unwrap());

        // `held` keeps its slot, `one` reserves a second, `two` stalls on the
        // provider listing until the batch is cancelled.
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let result = coordinator.get_next_job_assignments(3, &cancel).await;

        assert!(matches!(result, Err(CoordinatorError::Cancelled)));
        assert_eq!(health.get_provider_health(&p).await.current_load, 1);

        coordinator
            .release_job_from_provider(&held.id, &p, true, &CancellationToken::new())
            .await;
        assert_eq!(health.get_provider_health(&p).await.current_load, 0);
    }

    #[tokio::test]
    async fn test_cancelled_assign_leaves_no_load() {
        let fx = Fixture::new(2);
        let p = fx.provider("p").await;
        let j = fx.job("a").await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fx.coordinator.assign_job_to_provider(&j, &p, &cancel).await;

        assert!(matches!(result, Err(CoordinatorError::Cancelled)));
        assert_eq!(fx.load(&p).await, 0);
        let stored = fx.store.get_job(&j).await.unwrap().unwrap();
        assert!(stored.provider_id.is_none());
    }

    #[tokio::test]
    async fn test_release_records_failure_with_timing() {
        let fx = Fixture::new(2);
        let p = fx.provider("p").await;
        let mut job = Job::new("proj", "t", "p");
        StateMachine::try_transition(&mut job, JobStatus::Started, None);
        job.started_at = Some(Utc::now() - chrono::Duration::seconds(4));
        job.error_message = Some("agent crashed".into());
        StateMachine::try_transition(&mut job, JobStatus::Failed, None);
        fx.store.save_job(&job).await.unwrap();
        fx.coordinator.health().increment_provider_load(&p).await;

        fx.coordinator
            .release_job_from_provider(&job.id, &p, false, &fx.cancel)
            .await;

        let health = fx.coordinator.health().get_provider_health(&p).await;
        assert_eq!(health.current_load, 0);
        assert_eq!(health.total_failures, 1);
        assert_eq!(health.last_error.as_deref(), Some("agent crashed"));
        let avg = health.average_response_time.unwrap();
        assert!(avg >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_rebalance_moves_only_waiting_jobs() {
        let notifier = Arc::new(BroadcastNotifier::new(32));
        let mut rx = notifier.subscribe();
        let store = Arc::new(InMemoryStore::new());
        let health = Arc::new(HealthTracker::default());
        let coordinator =
            Coordinator::from_store(store.clone(), health.clone(), CoordinatorConfig::default())
                .with_notifier(notifier);
        let cancel = CancellationToken::new();

        let p1 = ProviderId::new("p1");
        let p2 = ProviderId::new("p2");
        store.save_provider(&Provider::new("p1", "a")).await.unwrap();
        store.save_provider(&Provider::new("p2", "b")).await.unwrap();

        let mut waiting = Job::new("proj-a", "t", "p");
        StateMachine::try_transition(&mut waiting, JobStatus::Pending, None);
        store.save_job(&waiting).await.unwrap();
        assert!(coordinator
            .assign_job_to_provider(&waiting.id, &p1, &cancel)
            .await
            .unwrap());

        let mut running = Job::new("proj-b", "t", "p").with_provider(p1.clone());
        StateMachine::try_transition(&mut running, JobStatus::Started, None);
        store.save_job(&running).await.unwrap();

        health.force_circuit_state(&p1, CircuitState::Open).await;

        let moved = coordinator.rebalance_jobs(&cancel).await.unwrap();
        assert_eq!(moved, 1);

        let stored = store.get_job(&waiting.id).await.unwrap().unwrap();
        assert_eq!(stored.provider_id, Some(p2.clone()));
        let stored = store.get_job(&running.id).await.unwrap().unwrap();
        assert_eq!(stored.provider_id, Some(p1.clone()));
        assert_eq!(health.get_provider_health(&p1).await.current_load, 0);
        assert_eq!(health.get_provider_health(&p2).await.current_load, 1);

        let mut saw_reassigned = false;
        while let Ok(event) = rx.try_recv() {
            if let DispatchEventKind::JobReassigned { from, to, .. } = event.kind {
                assert_eq!((from, to), (p1.clone(), p2.clone()));
                saw_reassigned = true;
            }
        }
        assert!(saw_reassigned);
    }
}

//! Job/provider persistence and the pending-job queue.
//!
//! Persistence is an external collaborator; these traits describe the calls
//! the coordinator makes. [`InMemoryStore`] implements all of them for tests
//! and the simulation binary.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use jobrelay_core::{Job, JobId, JobStatus, ProjectId, Provider, ProviderId};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write conflict: {0}")]
    Conflict(String),
}

/// Point lookups and saves for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Persist every field of `job` in one atomic write.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Jobs whose status is one of `statuses`.
    async fn list_jobs(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError>;
}

/// Provider configuration lookups.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn get_provider(&self, provider_id: &ProviderId) -> Result<Option<Provider>, StoreError>;

    /// Enabled providers ordered by name.
    async fn list_enabled_providers(&self) -> Result<Vec<Provider>, StoreError>;

    async fn save_provider(&self, provider: &Provider) -> Result<(), StoreError>;
}

/// Source of jobs ready to be scheduled.
#[async_trait]
pub trait PendingJobQueue: Send + Sync {
    /// Up to `limit` runnable jobs, highest priority first, then oldest first.
    ///
    /// Jobs whose project already has an active job are excluded.
    async fn get_pending_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError>;
}

/// In-memory store backing all three traits.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    providers: RwLock<HashMap<ProviderId, Provider>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job.
    pub async fn all_jobs(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn list_jobs(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| statuses.contains(&j.status()))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}

#[async_trait]
impl ProviderStore for InMemoryStore {
    async fn get_provider(&self, provider_id: &ProviderId) -> Result<Option<Provider>, StoreError> {
        Ok(self.providers.read().await.get(provider_id).cloned())
    }

    async fn list_enabled_providers(&self) -> Result<Vec<Provider>, StoreError> {
        let mut providers: Vec<Provider> = self
            .providers
            .read()
            .await
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(providers)
    }

    async fn save_provider(&self, provider: &Provider) -> Result<(), StoreError> {
        self.providers
            .write()
            .await
            .insert(provider.id.clone(), provider.clone());
        Ok(())
    }
}

#[async_trait]
impl PendingJobQueue for InMemoryStore {
    async fn get_pending_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;

        let busy_projects: HashSet<&ProjectId> = jobs
            .values()
            .filter(|j| j.status().is_active() || j.status() == JobStatus::Paused)
            .map(|j| &j.project_id)
            .collect();

        let mut candidates: Vec<&Job> = jobs
            .values()
            .filter(|j| j.status().is_waiting() && !j.cancellation_requested)
            .filter(|j| !busy_projects.contains(&j.project_id))
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        // One job per project so a single batch cannot run two of them at once.
        let mut seen = HashSet::new();
        Ok(candidates
            .into_iter()
            .filter(|j| seen.insert(j.project_id.clone()))
            .take(limit)
            .cloned()
            .collect())
    }
}

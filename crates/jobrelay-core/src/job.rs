//! Job type.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobStatus, ProjectId, ProviderId};

/// A Job is one long-running agent task.
///
/// The `status` field is private: it is written only by
/// [`StateMachine::try_transition`](crate::StateMachine::try_transition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,

    /// Project this job belongs to.
    pub project_id: ProjectId,

    /// Short human-readable title.
    pub title: String,

    /// Prompt handed to the provider.
    pub prompt: String,

    /// Current lifecycle status.
    pub(crate) status: JobStatus,

    /// Provider this job is bound to, if any.
    pub provider_id: Option<ProviderId>,

    /// Scheduling priority; higher runs first.
    pub priority: i32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    /// Number of retries already consumed.
    pub retry_count: u32,

    /// Retry budget.
    pub max_retries: u32,

    /// Set when a user asked for the job to stop.
    pub cancellation_requested: bool,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,

    /// Accumulated output text.
    pub output: String,

    /// Last error reported by the provider.
    pub error_message: Option<String>,

    /// What the agent is doing right now, for display.
    pub current_activity: Option<String>,

    /// Binding to the worker slot executing this job.
    pub worker_id: Option<String>,

    /// OS process handle of the running agent, if it runs as a subprocess.
    pub process_id: Option<u32>,
}

impl Job {
    /// Create a new Job in status `New`.
    pub fn new(
        project_id: impl Into<ProjectId>,
        title: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            project_id: project_id.into(),
            title: title.into(),
            prompt: prompt.into(),
            status: JobStatus::New,
            provider_id: None,
            priority: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_activity_at: None,
            last_heartbeat_at: None,
            retry_count: 0,
            max_retries: 3,
            cancellation_requested: false,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            output: String::new(),
            error_message: None,
            current_activity: None,
            worker_id: None,
            process_id: None,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder method to pin the job to a provider.
    pub fn with_provider(mut self, provider_id: ProviderId) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    /// Current lifecycle status.
    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Time spent since the job started, if it has.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at.map(|started| now - started)
    }

    /// Time since the last activity signal, falling back to the start time.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_activity_at
            .or(self.started_at)
            .map(|last| now - last)
    }

    /// Record a human-readable activity update.
    pub fn record_activity(&mut self, activity: impl Into<String>) {
        self.current_activity = Some(activity.into());
        self.last_activity_at = Some(Utc::now());
    }

    /// Record a liveness heartbeat from the executing provider.
    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat_at = Some(Utc::now());
    }

    /// Accumulate token usage and cost reported by a provider.
    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        self.input_tokens = self.input_tokens.saturating_add(input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(output_tokens);
        self.cost_usd += cost_usd;
    }

    /// Append provider output and count it as activity.
    pub fn append_output(&mut self, text: &str) {
        self.output.push_str(text);
        self.last_activity_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new("proj", "Refactor parser", "Refactor the parser module");
        assert_eq!(job.status(), JobStatus::New);
        assert_eq!(job.retry_count, 0);
        assert!(job.provider_id.is_none());
        assert!(job.retries_remaining());
        assert!(job.elapsed(Utc::now()).is_none());
    }

    #[test]
    fn test_usage_accumulates() {
        let mut job = Job::new("proj", "t", "p");
        job.record_usage(100, 50, 0.25);
        job.record_usage(10, 5, 0.5);
        assert_eq!(job.input_tokens, 110);
        assert_eq!(job.output_tokens, 55);
        assert_eq!(job.total_tokens(), 165);
        assert!((job.cost_usd - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_usage_saturates() {
        let mut job = Job::new("proj", "t", "p");
        job.record_usage(u64::MAX - 1, u64::MAX, 0.0);
        job.record_usage(5, 5, 0.0);
        assert_eq!(job.input_tokens, u64::MAX);
        assert_eq!(job.output_tokens, u64::MAX);
        assert_eq!(job.total_tokens(), u64::MAX);
    }

    #[test]
    fn test_idle_falls_back_to_start() {
        let now = Utc::now();
        let mut job = Job::new("proj", "t", "p");
        assert!(job.idle_for(now).is_none());

        job.started_at = Some(now - Duration::minutes(4));
        assert_eq!(job.idle_for(now), Some(Duration::minutes(4)));

        job.last_activity_at = Some(now - Duration::minutes(1));
        assert_eq!(job.idle_for(now), Some(Duration::minutes(1)));
    }
}

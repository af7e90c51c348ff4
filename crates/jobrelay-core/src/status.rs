//! Status enums for Jobs and provider circuits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a Job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job created (or reset for retry), not yet queued.
    #[default]
    New,
    /// Job queued and waiting for a provider slot.
    Pending,
    /// Job handed to a provider, execution starting.
    Started,
    /// Provider is actively producing output.
    Processing,
    /// Job is waiting on interactive input.
    Paused,
    /// No activity observed for longer than the stall timeout.
    Stalled,
    /// Job finished successfully.
    Completed,
    /// Job failed.
    Failed,
    /// Job was cancelled by user or system.
    Cancelled,
}

impl JobStatus {
    /// Every status, in declaration order.
    pub const ALL: [JobStatus; 9] = [
        JobStatus::New,
        JobStatus::Pending,
        JobStatus::Started,
        JobStatus::Processing,
        JobStatus::Paused,
        JobStatus::Stalled,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Returns true for Completed, Failed and Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true while a provider is working on the job.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started | Self::Processing)
    }

    /// Returns true while the job waits for a provider.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::New | Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Stalled => "stalled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a provider's circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, work may be routed to the provider.
    #[default]
    Closed,
    /// Provider is failing and excluded from selection.
    Open,
    /// Trial period after the reset timeout.
    HalfOpen,
}

impl CircuitState {
    /// Returns true if work may be routed through this circuit.
    pub fn allows_requests(&self) -> bool {
        !matches!(self, Self::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

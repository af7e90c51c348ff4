//! Dispatch events published to notification sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CircuitState, JobId, JobStatus, ProjectId, ProviderId};

/// An outward-facing notification about jobs or providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: DispatchEventKind,
}

impl DispatchEvent {
    pub fn new(kind: DispatchEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn job_created(job_id: JobId, project_id: ProjectId) -> Self {
        Self::new(DispatchEventKind::JobCreated { job_id, project_id })
    }

    pub fn status_changed(
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        reason: Option<String>,
    ) -> Self {
        Self::new(DispatchEventKind::StatusChanged {
            job_id,
            from,
            to,
            reason,
        })
    }

    pub fn job_assigned(job_id: JobId, provider_id: ProviderId) -> Self {
        Self::new(DispatchEventKind::JobAssigned {
            job_id,
            provider_id,
        })
    }

    pub fn job_reassigned(job_id: JobId, from: ProviderId, to: ProviderId) -> Self {
        Self::new(DispatchEventKind::JobReassigned { job_id, from, to })
    }

    pub fn job_released(job_id: JobId, provider_id: ProviderId, success: bool) -> Self {
        Self::new(DispatchEventKind::JobReleased {
            job_id,
            provider_id,
            success,
        })
    }

    pub fn circuit_state_changed(
        provider_id: ProviderId,
        from: CircuitState,
        to: CircuitState,
    ) -> Self {
        Self::new(DispatchEventKind::CircuitStateChanged {
            provider_id,
            from,
            to,
        })
    }

    /// Job this event concerns, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match &self.kind {
            DispatchEventKind::JobCreated { job_id, .. }
            | DispatchEventKind::StatusChanged { job_id, .. }
            | DispatchEventKind::JobAssigned { job_id, .. }
            | DispatchEventKind::JobReassigned { job_id, .. }
            | DispatchEventKind::JobReleased { job_id, .. } => Some(job_id),
            DispatchEventKind::CircuitStateChanged { .. } => None,
        }
    }
}

/// Type-specific payload of a [`DispatchEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DispatchEventKind {
    JobCreated {
        job_id: JobId,
        project_id: ProjectId,
    },
    StatusChanged {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        reason: Option<String>,
    },
    JobAssigned {
        job_id: JobId,
        provider_id: ProviderId,
    },
    JobReassigned {
        job_id: JobId,
        from: ProviderId,
        to: ProviderId,
    },
    JobReleased {
        job_id: JobId,
        provider_id: ProviderId,
        success: bool,
    },
    CircuitStateChanged {
        provider_id: ProviderId,
        from: CircuitState,
        to: CircuitState,
    },
}

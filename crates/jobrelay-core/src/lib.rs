//! jobrelay Core Domain Types
//!
//! This crate contains the pure job-lifecycle domain with no dependencies on:
//! - Network or storage
//! - Async runtime specifics
//!
//! It defines jobs, providers, the job state machine and the completion
//! evaluator that decides when a running job is finished, stalled or failed.

pub mod completion;
pub mod criteria;
pub mod error;
pub mod event;
pub mod ids;
pub mod job;
pub mod provider;
pub mod state_machine;
pub mod status;

// Re-export commonly used types
pub use completion::{CompletionEvaluation, CompletionReason};
pub use criteria::JobCompletionCriteria;
pub use error::CoreError;
pub use event::{DispatchEvent, DispatchEventKind};
pub use ids::{JobId, ProjectId, ProviderId};
pub use job::Job;
pub use provider::Provider;
pub use state_machine::{StateMachine, StateTransitionResult};
pub use status::{CircuitState, JobStatus};

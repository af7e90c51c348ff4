//! Core domain errors.

use thiserror::Error;

use crate::JobStatus;

/// Core domain errors for jobrelay.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Provider not found.
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: JobStatus, to: JobStatus },

    /// A completion pattern failed to compile.
    #[error("Invalid completion pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

//! Completion criteria supplied per job class.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Stopping criteria a running job is evaluated against.
///
/// Every limit is optional; `None` disables that check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobCompletionCriteria {
    /// Wall-clock budget measured from the job's start time.
    pub max_execution_time: Option<Duration>,

    /// Output-token budget.
    pub max_tokens: Option<u64>,

    /// Cost budget in US dollars.
    pub max_cost_usd: Option<f64>,

    /// Maximum time without an activity signal.
    pub stall_timeout: Option<Duration>,

    /// Regex matched against the output to detect success.
    pub success_pattern: Option<String>,

    /// Regex matched against output plus error message to detect failure.
    pub failure_pattern: Option<String>,
}

impl Default for JobCompletionCriteria {
    fn default() -> Self {
        Self {
            max_execution_time: Some(Duration::from_secs(60 * 60)),
            max_tokens: Some(100_000),
            max_cost_usd: Some(10.0),
            stall_timeout: Some(Duration::from_secs(10 * 60)),
            success_pattern: None,
            failure_pattern: None,
        }
    }
}

impl JobCompletionCriteria {
    /// Criteria with every check disabled.
    pub fn unbounded() -> Self {
        Self {
            max_execution_time: None,
            max_tokens: None,
            max_cost_usd: None,
            stall_timeout: None,
            success_pattern: None,
            failure_pattern: None,
        }
    }

    /// Tight limits for short interactive tasks.
    pub fn quick_task() -> Self {
        Self {
            max_execution_time: Some(Duration::from_secs(10 * 60)),
            max_tokens: Some(20_000),
            max_cost_usd: Some(1.0),
            stall_timeout: Some(Duration::from_secs(3 * 60)),
            ..Self::unbounded()
        }
    }

    /// Generous limits for multi-hour agent sessions.
    pub fn long_running() -> Self {
        Self {
            max_execution_time: Some(Duration::from_secs(8 * 60 * 60)),
            max_tokens: Some(1_000_000),
            max_cost_usd: Some(50.0),
            stall_timeout: Some(Duration::from_secs(30 * 60)),
            ..Self::unbounded()
        }
    }

    pub fn with_success_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.success_pattern = Some(pattern.into());
        self
    }

    pub fn with_failure_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.failure_pattern = Some(pattern.into());
        self
    }

    /// Compile both patterns, reporting the first one that is malformed.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.compiled_patterns().map(|_| ())
    }

    pub(crate) fn compiled_patterns(&self) -> Result<CompiledPatterns, CoreError> {
        Ok(CompiledPatterns {
            success: compile(self.success_pattern.as_deref())?,
            failure: compile(self.failure_pattern.as_deref())?,
        })
    }
}

pub(crate) struct CompiledPatterns {
    pub success: Option<Regex>,
    pub failure: Option<Regex>,
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>, CoreError> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|e| CoreError::InvalidPattern {
                pattern: p.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

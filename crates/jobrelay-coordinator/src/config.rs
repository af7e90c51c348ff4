//! Coordinator configuration.

use std::time::Duration;

use serde::Deserialize;

/// Circuit breaker and sliding-window settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Failures inside the window that open the circuit.
    pub failure_threshold: usize,

    /// Sliding window for failure/success/response-time history (seconds).
    pub failure_window_secs: u64,

    /// Time an open circuit waits before going half-open (seconds).
    pub circuit_reset_timeout_secs: u64,

    /// Consecutive half-open successes needed to close the circuit.
    pub success_threshold: u32,

    /// Cap on retained response-time samples per provider.
    pub max_response_samples: usize,

    /// Bound on a single health read before it is treated as unhealthy (ms).
    pub health_read_timeout_ms: u64,
}

impl HealthConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn circuit_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_reset_timeout_secs)
    }

    pub fn health_read_timeout(&self) -> Duration {
        Duration::from_millis(self.health_read_timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 5 * 60,
            circuit_reset_timeout_secs: 2 * 60,
            success_threshold: 2,
            max_response_samples: 100,
            health_read_timeout_ms: 500,
        }
    }
}

/// Provider selection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Concurrency cap applied to every provider.
    pub max_jobs_per_provider: u32,

    /// Advisory bound on one selection attempt (seconds).
    ///
    /// The coordinator does not enforce this; the calling loop does.
    pub provider_selection_timeout_secs: u64,

    /// Multiplier applied to the batch size when pulling pending candidates.
    pub candidate_overfetch: usize,
}

impl CoordinatorConfig {
    pub fn provider_selection_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_selection_timeout_secs)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_provider: 3,
            provider_selection_timeout_secs: 30,
            candidate_overfetch: 2,
        }
    }
}

/// Scheduler loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Assignments requested per tick.
    pub max_jobs_per_tick: usize,

    /// Pause between ticks (ms).
    pub tick_interval_ms: u64,
}

impl DispatcherConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_tick: 4,
            tick_interval_ms: 1000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub health: HealthConfig,
    pub coordinator: CoordinatorConfig,
    pub dispatcher: DispatcherConfig,
}

impl Config {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

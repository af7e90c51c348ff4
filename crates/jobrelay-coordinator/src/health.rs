//! Provider health tracking and circuit breaking.
//!
//! Each provider gets its own record behind its own mutex, so outcomes for
//! different providers never contend. The outer map lock is held only long
//! enough to find or create a record.
//!
//! Circuit states:
//! - Closed: normal operation, the provider may be selected
//! - Open: too many failures inside the window, the provider is excluded
//! - HalfOpen: reset timeout elapsed, successes close the circuit and any
//!   failure reopens it
//!
//! The Open -> HalfOpen promotion is lazy: it happens on the next read or
//! recorded outcome rather than on a timer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use jobrelay_core::{CircuitState, DispatchEvent, ProviderId};

use crate::config::HealthConfig;
use crate::notify::{NoopNotifier, NotificationSink};

/// Point-in-time view of a provider's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub provider_id: ProviderId,
    pub circuit_state: CircuitState,
    /// False only while the circuit is open.
    pub is_healthy: bool,
    /// Jobs currently assigned to the provider.
    pub current_load: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub recent_successes: usize,
    pub recent_failures: usize,
    /// Failures / (failures + successes) inside the window; 0 with no history.
    pub recent_failure_rate: f64,
    pub average_response_time: Option<Duration>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub time_since_last_failure: Option<Duration>,
    pub last_error: Option<String>,
}

type Transition = (CircuitState, CircuitState);

#[derive(Debug, Default)]
struct ProviderRecord {
    load: u32,
    total_successes: u64,
    total_failures: u64,
    recent_successes: VecDeque<Instant>,
    recent_failures: VecDeque<Instant>,
    response_times: VecDeque<(Instant, Duration)>,
    consecutive_successes: u32,
    consecutive_failures: u32,
    circuit_state: CircuitState,
    opened_at: Option<Instant>,
    last_success: Option<(Instant, DateTime<Utc>)>,
    last_failure: Option<(Instant, DateTime<Utc>)>,
    last_error: Option<String>,
}

impl ProviderRecord {
    /// Drop history older than the window and apply the lazy half-open promotion.
    fn refresh(&mut self, now: Instant, config: &HealthConfig) -> Option<Transition> {
        let window = config.failure_window();
        prune(&mut self.recent_successes, now, window, |t| *t);
        prune(&mut self.recent_failures, now, window, |t| *t);
        prune(&mut self.response_times, now, window, |(t, _)| *t);

        if self.circuit_state == CircuitState::Open {
            let opened_at = self.opened_at.unwrap_or(now);
            if now.duration_since(opened_at) >= config.circuit_reset_timeout() {
                return Some(self.set_state(CircuitState::HalfOpen, now));
            }
        }
        None
    }

    fn set_state(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.circuit_state;
        self.circuit_state = to;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.recent_failures.clear();
                self.consecutive_failures = 0;
            }
        }
        (from, to)
    }

    fn push_response_time(&mut self, now: Instant, sample: Option<Duration>, cap: usize) {
        if let Some(sample) = sample {
            self.response_times.push_back((now, sample));
            while self.response_times.len() > cap {
                self.response_times.pop_front();
            }
        }
    }

    fn record_success(
        &mut self,
        now: Instant,
        response_time: Option<Duration>,
        config: &HealthConfig,
    ) -> Vec<Transition> {
        let mut transitions: Vec<Transition> = self.refresh(now, config).into_iter().collect();

        self.total_successes += 1;
        self.recent_successes.push_back(now);
        self.push_response_time(now, response_time, config.max_response_samples);
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_success = Some((now, Utc::now()));

        if self.circuit_state == CircuitState::HalfOpen
            && self.consecutive_successes >= config.success_threshold
        {
            transitions.push(self.set_state(CircuitState::Closed, now));
        }
        transitions
    }

    fn record_failure(
        &mut self,
        now: Instant,
        error: Option<&str>,
        response_time: Option<Duration>,
        config: &HealthConfig,
    ) -> Vec<Transition> {
        let mut transitions: Vec<Transition> = self.refresh(now, config).into_iter().collect();

        self.total_failures += 1;
        self.recent_failures.push_back(now);
        self.push_response_time(now, response_time, config.max_response_samples);
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_failure = Some((now, Utc::now()));
        if let Some(error) = error {
            self.last_error = Some(error.to_string());
        }

        match self.circuit_state {
            CircuitState::Closed if self.recent_failures.len() >= config.failure_threshold => {
                transitions.push(self.set_state(CircuitState::Open, now));
            }
            CircuitState::HalfOpen => {
                transitions.push(self.set_state(CircuitState::Open, now));
            }
            _ => {}
        }
        transitions
    }

    fn snapshot(&self, provider_id: &ProviderId, now: Instant) -> ProviderHealth {
        let recent_successes = self.recent_successes.len();
        let recent_failures = self.recent_failures.len();
        let total = recent_successes + recent_failures;
        let recent_failure_rate = if total == 0 {
            0.0
        } else {
            recent_failures as f64 / total as f64
        };

        let average_response_time = if self.response_times.is_empty() {
            None
        } else {
            let sum: Duration = self.response_times.iter().map(|(_, d)| *d).sum();
            Some(sum / self.response_times.len() as u32)
        };

        ProviderHealth {
            provider_id: provider_id.clone(),
            circuit_state: self.circuit_state,
            is_healthy: self.circuit_state.allows_requests(),
            current_load: self.load,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            recent_successes,
            recent_failures,
            recent_failure_rate,
            average_response_time,
            consecutive_successes: self.consecutive_successes,
            consecutive_failures: self.consecutive_failures,
            last_success_at: self.last_success.map(|(_, at)| at),
            last_failure_at: self.last_failure.map(|(_, at)| at),
            time_since_last_failure: self.last_failure.map(|(t, _)| now.duration_since(t)),
            last_error: self.last_error.clone(),
        }
    }
}

fn prune<T>(items: &mut VecDeque<T>, now: Instant, window: Duration, at: impl Fn(&T) -> Instant) {
    while let Some(front) = items.front() {
        if now.duration_since(at(front)) > window {
            items.pop_front();
        } else {
            break;
        }
    }
}

/// Tracks load and circuit state for every provider.
///
/// Runtime-only: a restart clears load and circuit history.
pub struct HealthTracker {
    config: HealthConfig,
    records: RwLock<HashMap<ProviderId, Arc<Mutex<ProviderRecord>>>>,
    notifier: Arc<dyn NotificationSink>,
}

impl HealthTracker {
    /// Create a tracker that does not publish events.
    pub fn new(config: HealthConfig) -> Self {
        Self::with_notifier(config, Arc::new(NoopNotifier))
    }

    /// Create a tracker that publishes circuit transitions to `notifier`.
    pub fn with_notifier(config: HealthConfig, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    async fn record(&self, provider_id: &ProviderId) -> Arc<Mutex<ProviderRecord>> {
        if let Some(record) = self.records.read().await.get(provider_id) {
            return record.clone();
        }
        self.records
            .write()
            .await
            .entry(provider_id.clone())
            .or_default()
            .clone()
    }

    fn announce(&self, provider_id: &ProviderId, transitions: Vec<Transition>) {
        for (from, to) in transitions {
            match to {
                CircuitState::Open => error!(
                    provider_id = %provider_id,
                    from = %from,
                    "Circuit breaker opened - provider excluded from selection"
                ),
                CircuitState::HalfOpen => info!(
                    provider_id = %provider_id,
                    "Circuit breaker half-open - testing recovery"
                ),
                CircuitState::Closed => info!(
                    provider_id = %provider_id,
                    from = %from,
                    "Circuit breaker closed - provider recovered"
                ),
            }
            self.notifier.publish(DispatchEvent::circuit_state_changed(
                provider_id.clone(),
                from,
                to,
            ));
        }
    }

    /// Record a successful job outcome.
    pub async fn record_success(&self, provider_id: &ProviderId, response_time: Option<Duration>) {
        let record = self.record(provider_id).await;
        let transitions = record
            .lock()
            .await
            .record_success(Instant::now(), response_time, &self.config);
        debug!(provider_id = %provider_id, "Recorded provider success");
        self.announce(provider_id, transitions);
    }

    /// Record a failed job outcome.
    pub async fn record_failure(
        &self,
        provider_id: &ProviderId,
        error: Option<&str>,
        response_time: Option<Duration>,
    ) {
        let record = self.record(provider_id).await;
        let transitions = record.lock().await.record_failure(
            Instant::now(),
            error,
            response_time,
            &self.config,
        );
        debug!(provider_id = %provider_id, error = ?error, "Recorded provider failure");
        self.announce(provider_id, transitions);
    }

    /// Increment in-flight load, returning the new value.
    pub async fn increment_provider_load(&self, provider_id: &ProviderId) -> u32 {
        let record = self.record(provider_id).await;
        let mut record = record.lock().await;
        record.load = record.load.saturating_add(1);
        record.load
    }

    /// Decrement in-flight load, clamped at zero, returning the new value.
    pub async fn decrement_provider_load(&self, provider_id: &ProviderId) -> u32 {
        let record = self.record(provider_id).await;
        let mut record = record.lock().await;
        if record.load == 0 {
            warn!(provider_id = %provider_id, "Load decrement below zero ignored");
        }
        record.load = record.load.saturating_sub(1);
        record.load
    }

    /// Prune the window, promote a timed-out open circuit, and snapshot.
    ///
    /// Unknown providers start with a closed circuit and no history.
    pub async fn get_provider_health(&self, provider_id: &ProviderId) -> ProviderHealth {
        let record = self.record(provider_id).await;
        let now = Instant::now();
        let (snapshot, transition) = {
            let mut record = record.lock().await;
            let transition = record.refresh(now, &self.config);
            (record.snapshot(provider_id, now), transition)
        };
        self.announce(provider_id, transition.into_iter().collect());
        snapshot
    }

    /// Snapshot bounded by the configured read timeout; `None` if it timed out.
    pub async fn try_get_provider_health(&self, provider_id: &ProviderId) -> Option<ProviderHealth> {
        match tokio::time::timeout(
            self.config.health_read_timeout(),
            self.get_provider_health(provider_id),
        )
        .await
        {
            Ok(health) => Some(health),
            Err(_) => {
                warn!(provider_id = %provider_id, "Health read timed out - assuming unhealthy");
                None
            }
        }
    }

    /// Health check that degrades to `false` when state cannot be read in time.
    pub async fn is_provider_healthy(&self, provider_id: &ProviderId) -> bool {
        self.try_get_provider_health(provider_id)
            .await
            .is_some_and(|h| h.is_healthy)
    }

    /// Snapshots for every tracked provider, ordered by id.
    pub async fn get_all_provider_health(&self) -> Vec<ProviderHealth> {
        let mut ids: Vec<ProviderId> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.get_provider_health(&id).await);
        }
        results
    }

    /// Clear all history and load for a provider, closing its circuit.
    pub async fn reset_provider(&self, provider_id: &ProviderId) {
        let record = self.record(provider_id).await;
        let from = {
            let mut record = record.lock().await;
            let from = record.circuit_state;
            *record = ProviderRecord::default();
            from
        };
        info!(provider_id = %provider_id, "Provider health reset");
        if from != CircuitState::Closed {
            self.announce(provider_id, vec![(from, CircuitState::Closed)]);
        }
    }

    /// Operator override of the circuit state.
    pub async fn force_circuit_state(&self, provider_id: &ProviderId, state: CircuitState) {
        let record = self.record(provider_id).await;
        let transition = {
            let mut record = record.lock().await;
            record.consecutive_successes = 0;
            record.consecutive_failures = 0;
            record.set_state(state, Instant::now())
        };
        warn!(provider_id = %provider_id, state = %state, "Circuit state forced by operator");
        if transition.0 != transition.1 {
            self.announce(provider_id, vec![transition]);
        }
    }

    /// Forget a provider entirely.
    pub async fn remove_provider(&self, provider_id: &ProviderId) {
        self.records.write().await.remove(provider_id);
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

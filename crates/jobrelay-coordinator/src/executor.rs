//! Provider execution boundary.
//!
//! How a provider actually runs a prompt is opaque to the coordinator; it
//! only sees the usage and outcome reported back.

use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use jobrelay_core::{Job, Provider, ProviderId};

/// What a provider reported after running a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub output: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    /// Set when the provider failed the job.
    pub error: Option<String>,
    /// Last activity line, if the provider reports one.
    pub activity: Option<String>,
}

impl ExecutionReport {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self.cost_usd = cost_usd;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs a job's prompt on a provider.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    async fn execute(&self, job: &Job, provider: &Provider) -> ExecutionReport;
}

/// Random latency, usage and failures, per provider.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    failure_rates: HashMap<ProviderId, f64>,
    default_failure_rate: f64,
    latency_ms: Range<u64>,
}

impl SimulatedExecutor {
    pub fn new(default_failure_rate: f64, latency_ms: Range<u64>) -> Self {
        Self {
            failure_rates: HashMap::new(),
            default_failure_rate: default_failure_rate.clamp(0.0, 1.0),
            latency_ms,
        }
    }

    /// Override the failure rate of one provider.
    pub fn with_failure_rate(mut self, provider_id: ProviderId, rate: f64) -> Self {
        self.failure_rates.insert(provider_id, rate.clamp(0.0, 1.0));
        self
    }

    fn failure_rate(&self, provider_id: &ProviderId) -> f64 {
        self.failure_rates
            .get(provider_id)
            .copied()
            .unwrap_or(self.default_failure_rate)
    }
}

#[async_trait]
impl ProviderExecutor for SimulatedExecutor {
    async fn execute(&self, job: &Job, provider: &Provider) -> ExecutionReport {
        // ThreadRng is !Send; draw everything before the first await.
        let (latency, fails, input_tokens, output_tokens) = {
            let mut rng = rand::thread_rng();
            let latency = if self.latency_ms.is_empty() {
                self.latency_ms.start
            } else {
                rng.gen_range(self.latency_ms.clone())
            };
            (
                latency,
                rng.gen_bool(self.failure_rate(&provider.id)),
                rng.gen_range(100..2_000u64),
                rng.gen_range(50..1_500u64),
            )
        };

        tokio::time::sleep(Duration::from_millis(latency)).await;

        let cost_usd = (input_tokens as f64 * 3.0 + output_tokens as f64 * 15.0) / 1_000_000.0;
        debug!(
            job_id = %job.id,
            provider_id = %provider.id,
            latency_ms = latency,
            fails,
            "Simulated execution finished"
        );

        let report = if fails {
            ExecutionReport::failure(format!("provider {} returned an error", provider.name))
        } else {
            ExecutionReport::success(format!("[{}] {}\nDONE\n", provider.name, job.title))
        };
        ExecutionReport {
            activity: Some(format!("ran on {}", provider.name)),
            ..report.with_usage(input_tokens, output_tokens, cost_usd)
        }
    }
}

//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use jobrelay_core::{CircuitState, JobStatus};

use crate::health::{HealthTracker, ProviderHealth};
use crate::store::{JobStore, StoreError};

/// Collect provider health and job counts as Prometheus text.
pub async fn collect_metrics(health: &HealthTracker, jobs: &dyn JobStore) -> Result<String, StoreError> {
    let mut output = String::new();

    collect_provider_metrics(&health.get_all_provider_health().await, &mut output);
    collect_job_metrics(jobs, &mut output).await?;

    Ok(output)
}

fn gauge(output: &mut String, name: &str, help: &str) {
    writeln!(output, "# HELP {name} {help}").ok();
    writeln!(output, "# TYPE {name} gauge").ok();
}

/// Per-provider load, failure rate and circuit state.
fn collect_provider_metrics(providers: &[ProviderHealth], output: &mut String) {
    gauge(output, "jobrelay_provider_load", "Jobs currently assigned to the provider");
    for h in providers {
        writeln!(
            output,
            "jobrelay_provider_load{{provider=\"{}\"}} {}",
            h.provider_id, h.current_load
        )
        .ok();
    }

    writeln!(output).ok();
    gauge(
        output,
        "jobrelay_provider_failure_rate",
        "Failure rate inside the sliding window",
    );
    for h in providers {
        writeln!(
            output,
            "jobrelay_provider_failure_rate{{provider=\"{}\"}} {}",
            h.provider_id, h.recent_failure_rate
        )
        .ok();
    }

    writeln!(output).ok();
    gauge(
        output,
        "jobrelay_provider_circuit_state",
        "1 for the provider's current circuit state, 0 otherwise",
    );
    for h in providers {
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            writeln!(
                output,
                "jobrelay_provider_circuit_state{{provider=\"{}\",state=\"{}\"}} {}",
                h.provider_id,
                state,
                u8::from(h.circuit_state == state)
            )
            .ok();
        }
    }
}

/// Job counts by status.
async fn collect_job_metrics(jobs: &dyn JobStore, output: &mut String) -> Result<(), StoreError> {
    let all = jobs.list_jobs(&JobStatus::ALL).await?;

    writeln!(output).ok();
    gauge(output, "jobrelay_jobs_total", "Total number of jobs by status");
    for status in JobStatus::ALL {
        let count = all.iter().filter(|j| j.status() == status).count();
        writeln!(output, "jobrelay_jobs_total{{status=\"{status}\"}} {count}").ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use jobrelay_core::{Job, ProviderId, StateMachine};

    #[tokio::test]
    async fn test_collect_metrics_empty_state() {
        let output = collect_metrics(&HealthTracker::default(), &InMemoryStore::new())
            .await
            .unwrap();

        assert!(output.contains("# TYPE jobrelay_provider_load gauge"));
        assert!(output.contains("jobrelay_jobs_total{status=\"pending\"} 0"));
        assert!(output.contains("jobrelay_jobs_total{status=\"completed\"} 0"));
    }

    #[tokio::test]
    async fn test_collect_metrics_with_providers_and_jobs() {
        let health = HealthTracker::default();
        let p = ProviderId::new("p1");
        health.increment_provider_load(&p).await;
        health.record_success(&p, None).await;
        health.record_failure(&p, None, None).await;

        let store = InMemoryStore::new();
        let mut running = Job::new("a", "t", "p");
        StateMachine::try_transition(&mut running, JobStatus::Started, None);
        store.save_job(&running).await.unwrap();
        store.save_job(&Job::new("b", "t", "p")).await.unwrap();

        let output = collect_metrics(&health, &store).await.unwrap();

        assert!(output.contains("jobrelay_provider_load{provider=\"p1\"} 1"));
        assert!(output.contains("jobrelay_provider_failure_rate{provider=\"p1\"} 0.5"));
        assert!(output.contains("jobrelay_provider_circuit_state{provider=\"p1\",state=\"closed\"} 1"));
        assert!(output.contains("jobrelay_provider_circuit_state{provider=\"p1\",state=\"open\"} 0"));
        assert!(output.contains("jobrelay_jobs_total{status=\"started\"} 1"));
        assert!(output.contains("jobrelay_jobs_total{status=\"new\"} 1"));
    }
}

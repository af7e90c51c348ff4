//! jobrelay Coordinator Library
//!
//! This crate routes jobs to execution providers: per-provider health
//! tracking with a circuit breaker, provider scoring and assignment, the
//! store and queue boundaries, and a reference dispatcher loop.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod executor;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod store;

pub use config::{Config, CoordinatorConfig, DispatcherConfig, HealthConfig};
pub use coordinator::{score_provider, Coordinator, CoordinatorError, JobAssignment};
pub use dispatcher::{DispatchSummary, Dispatcher, TickSummary};
pub use executor::{ExecutionReport, ProviderExecutor, SimulatedExecutor};
pub use health::{HealthTracker, ProviderHealth};
pub use lifecycle::JobLifecycle;
pub use notify::{BroadcastNotifier, NoopNotifier, NotificationSink};
pub use store::{InMemoryStore, JobStore, PendingJobQueue, ProviderStore, StoreError};

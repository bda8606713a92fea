//! Process-level services around the reconciler
//!
//! - `/healthz`, `/readyz` and `/metrics` over HTTP
//! - Lease-based leader election for multi-replica deployments
//! - Graceful shutdown on SIGTERM/SIGINT

mod health;
pub mod leader;
pub mod metrics;
pub mod shutdown;

pub use health::{run_health_server, ReadinessState};
pub use leader::{run_leader_election, LeaderConfig, LeaderState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "leader_test.rs"]
mod leader_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;

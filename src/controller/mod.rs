pub mod assessment;
pub mod backoff;
pub mod cache;
pub mod clock;
pub mod experiment;
pub mod prometheus;
pub mod snapshot;
pub mod store;
pub mod traffic;

#[cfg(test)]
pub(crate) mod testing;

pub use experiment::{error_policy, reconcile, Context, ReconcileError};

//! vaaka: a metrics-driven canary experiment controller for Kubernetes
//!
//! An `Experiment` compares a baseline and a candidate Service. Every
//! reconcile tick observes live metrics, judges the experiment's success
//! criteria, shifts Gateway API traffic toward the candidate, and persists
//! the outcome with optimistic concurrency.

pub mod config;
pub mod controller;
pub mod crd;
pub mod server;

//! Reconciliation core for progressive delivery of Kubernetes workloads.
//!
//! A [`crd::canary::Canary`] names a target workload. The controllers in
//! [`controller`] keep a `{target}-primary` copy of it converged, classify
//! readiness, detect drift in the target and its ConfigMaps/Secrets, and
//! mirror any attached autoscaler onto the primary.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;

//! autodrain: keeps unhealthy Kubernetes nodes empty
//!
//! Nodes that stop reporting Ready (or that the cluster announces are shutting
//! down) are cordoned and drained of everything except daemon-set pods. Nodes
//! that come back Ready are uncordoned.

#![warn(clippy::unwrap_used, clippy::expect_used)]

pub mod cluster;
pub mod config;
pub mod controller;
pub mod server;

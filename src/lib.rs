//! Scalegate - A load-balancing reverse proxy with an elastic backend pool
//!
//! This library provides:
//! - A host pool published as lock-free snapshots, with sticky sessions and
//!   priority failover across AVAILABLE / FULL / PROBLEM hosts
//! - Pluggable selector strategies (round-robin, random, type-affine,
//!   heterogeneous)
//! - Scaling groups whose autoscalers grow and shrink the pool from remote
//!   metrics or from direct load probes
//! - An instance lifecycle manager that launches and terminates provider
//!   instances with deadlines and backoff

pub mod admin;
pub mod autoscale;
pub mod config;
pub mod error;
pub mod group;
pub mod host;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod proxy;
pub mod router;
pub mod selector;

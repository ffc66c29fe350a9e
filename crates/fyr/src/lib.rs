//! Fyr watches workload rollouts, alert webhooks and namespace health, and
//! decides when something is worth investigating.
//!
//! # Architecture
//!
//! - [`rollout`] tracks one rollout per workload generation and settles it
//!   to SUCCESS or FAILED
//! - [`alerts`] throttles incoming alerts per fingerprint and batches the
//!   admitted ones by namespace and service
//! - [`incidents`] scans namespaces for stuck deletions, quota exhaustion
//!   and eviction or restart storms
//! - [`jobs`] drains the investigation queue under hourly caps, calls the
//!   [`diagnose`] engine, [`triage`]s the answer and notifies
//!
//! The loops share nothing but the [`store::Store`].

#![warn(clippy::pedantic)]

pub mod alerts;
pub mod cluster;
pub mod config;
pub mod diagnose;
pub mod error;
pub mod incidents;
pub mod jobs;
pub mod model;
pub mod namespace_cache;
pub mod rollout;
pub mod server;
pub mod service;
pub mod store;
pub mod triage;

pub use config::Settings;
pub use error::{Error, Result};

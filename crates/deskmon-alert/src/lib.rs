//! Monitoring and alerting engine.
//!
//! Producers record metric samples into a [`sink::MetricSink`]; a single
//! [`scheduler::Scheduler`] loop flushes them to the metrics store, evaluates
//! every enabled rule over its trailing window, escalates stale alerts and
//! applies retention. [`engine::MonitoringEngine`] ties the pieces together
//! and exposes the administrative API.

pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod flusher;
pub mod lifecycle;
pub mod resolver;
pub mod rule;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod window;

#[cfg(test)]
mod tests;

pub use config::{MonitoringConfig, MonitoringConfigUpdate};
pub use engine::MonitoringEngine;
pub use error::{MonitorError, Result};

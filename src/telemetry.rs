//! Operator health and Prometheus endpoints.

pub mod health;
pub mod metrics;

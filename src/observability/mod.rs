//! Observability infrastructure
//!
//! Prometheus metrics, per-subsystem health tracking, and the two HTTP
//! exposition endpoints (metrics and health run on distinct ports).

mod health;
mod metrics;
mod server;

pub use health::{components, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse};
pub use metrics::Metrics;
pub use server::{health_router, metrics_router, serve};

//! Prometheus backend for recon node metrics.
//!
//! [`PrometheusMetrics`] implements [`recon_core::MetricsBackend`]; hand an
//! `Arc` of it to the node and serve [`PrometheusMetrics::render`] from the
//! HTTP layer.
//!
//! ## Metrics
//! - `recon_dispatch_total{outcome}` - per-node init outcomes of a fan-out
//! - `recon_node_reports_total{status}` - per-node status reports applied
//! - `recon_upstream_notifications_total{kind, outcome}` - finished/failed reports sent upstream
//! - `recon_capture_cycles_total{outcome}` - runner cycles by result

mod backend;
pub use backend::PrometheusMetrics;

pub use prometheus::{Encoder, Registry, TextEncoder};

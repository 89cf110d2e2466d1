//! Telemetry: structured logs, optional OTLP traces, and lifecycle metrics.
//!
//! # Telemetry invariants
//!
//! - **No key material** must appear in any span attribute, metric label,
//!   or log field. Key ids, types, fingerprints and states are fine.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`).

pub mod init;
pub mod metrics;

pub use init::init_telemetry;
pub use metrics::KeyMetrics;

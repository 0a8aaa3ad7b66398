//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! client / server / worker pool produce:
//!     → logging.rs (structured tracing events, throttled overload warnings)
//!     → metrics.rs (counters and gauges via the `metrics` facade)
//!
//! Consumers:
//!     → tracing-subscriber fmt layer (stdout)
//!     → Prometheus scrape endpoint (optional, binary only)
//! ```
//!
//! # Design Decisions
//! - Library code only emits; installing subscribers and recorders is left
//!   to the binary or embedding application
//! - Client disconnects are logged at debug level unless `log_all_errors`
//! - Overload warnings are emitted at most once per minute

pub mod logging;
pub mod metrics;

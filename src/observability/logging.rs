//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber for the binary
//! - Classify errors that are normal client behavior (disconnects, timeouts)
//! - Throttle repeated overload warnings
//! - Render panic payloads for log lines

use std::any::Any;
use std::io;
use std::time::Duration;

use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_logging(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.to_owned().into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// True for I/O errors caused by the peer going away or idling out.
pub fn is_disconnect_noise(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

/// Allows one event per interval.
#[derive(Debug)]
pub struct ErrorThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ErrorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Once per minute, the cadence used for overload warnings.
    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    /// Returns true if the caller should log now.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger → every subscriber wakes → accept loops close their listeners
//!
//! Signals (signals.rs):
//!     Ctrl-C / SIGTERM → Shutdown::trigger
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;

//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Client request:
//!     → retries.rs (replay idempotent requests once after a transport failure)
//!     → backoff.rs (jittered, doubling sleeps while the pool is exhausted,
//!       clipped to the caller's remaining time)
//! ```
//!
//! # Design Decisions
//! - Never replay POST/PATCH/DELETE: the server may have acted on them
//! - Backoff never sleeps past the caller's deadline

pub mod backoff;
pub mod retries;

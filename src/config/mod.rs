//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → FastwireConfig (validated, immutable)
//!     → ServerConfig / ClientConfig handed to the engines by value
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; engines copy what they need
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ClientConfig, FastwireConfig, HostClientConfig, ListenerConfig, ObservabilityConfig, PipelineClientConfig,
    ServerConfig,
};
pub use validation::{validate_config, ValidationError};

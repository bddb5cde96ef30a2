//! Duet Core - Foundation types, error handling, configuration, and logging.
//!
//! This crate provides the shared foundation used by all other Duet crates:
//! - Application configuration (API endpoints, realtime tuning, E2EE policy)
//! - A single error enum covering network, crypto, protocol and local failures
//! - Structured logging with tracing
//! - Platform data directories
//! - Common constants

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod platform;

// Re-export commonly used items at the crate root
pub use config::AppConfig;
pub use error::{DuetError, DuetResult};
pub use logging::{init_from_config, init_logging};
pub use platform::Platform;

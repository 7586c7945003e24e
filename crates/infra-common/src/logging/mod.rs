//! Logging standardization for the bridge.

pub mod setup;

pub use setup::{parse_log_level, setup_logging, LoggingConfig};

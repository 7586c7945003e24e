/*!
# infra-common

A common infrastructure layer for the Switchboard conference bridge that
provides:

- Logging standardization on top of `tracing`
- Lock-free snapshot publication between a single writer and many readers
- Bounded collections used by the media engine's hot path
- Common error types and handling

This crate serves as a horizontal layer that the engine crates leverage to
ensure consistency and reduce duplication.
*/

pub mod collections;
pub mod errors;
pub mod logging;
pub mod strings;
pub mod sync;

/// Re-export commonly used types
pub use collections::index_list::{IndexList, NodeId};
pub use errors::types::Error;
pub use logging::setup::setup_logging;
pub use strings::StringBuilder;
pub use sync::publish::Publish;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Cross-thread publication primitives.

pub mod publish;

pub use publish::Publish;

//! Payloads the engine emits toward clients.

pub mod data_channel;

pub use data_channel::DataChannelMessageBuilder;

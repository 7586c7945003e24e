//! Bounded collections for single-writer hot paths.

pub mod index_list;

pub use index_list::{IndexList, NodeId};

//! Application State Graph
//!
//! The dynamic value model shared by the live store and the history
//! snapshots, plus the tagged encoding used to persist snapshots.

pub mod codec;
pub mod value;

pub use value::{Node, StateValue};

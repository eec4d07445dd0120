//! Data model for decoded save state.
//!
//! This module contains the in-memory object graph shared by the pickle
//! codec and the text bridge:
//! - Values (immutable data and references)
//! - Nodes (lists, dicts, sets and instances with identity)
//! - The graph arena that owns the nodes

pub mod graph;
pub mod value;

pub use graph::Graph;
pub use value::{Constructor, Instance, Node, NodeId, State, Value, ValueMap, ValueSet};

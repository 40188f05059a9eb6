//! Flow graphs: the typed model, publish-time validation and the versioned store.

pub mod model;
pub mod store;
pub mod validate;

pub use model::{
    Edge, Flow, FlowGraph, FlowSnapshot, FlowStatus, FlowVersion, MessageContent, Node, NodeKind,
};
pub use store::FlowStore;
pub use validate::validate_graph;

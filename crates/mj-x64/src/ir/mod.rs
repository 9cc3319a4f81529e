//! The SSA intermediate representation consumed by the backend.

mod builder;
mod display;
mod graph;

pub use builder::GraphBuilder;
pub use graph::{Graph, Mode, Node, NodeId, NodeKind, ProjKind, Relation};

//! The experiment graph and its builder.
//!
//! The experiment graph is the in-memory representation of the virtual
//! network: vertices (hosts, routers, switches) and undirected edges
//! (links), both decorable with named capability sets contributed by model
//! components. The builder walks the resolver's canonical component order,
//! loading each component's decorator set and invoking its plugin against
//! the shared graph.

pub mod builder;
pub mod decorate;
pub mod graph;
pub mod plugin;

pub use builder::{any_errors, BuildReport, ExperimentBuilder};
pub use decorate::{ConflictHandler, DecorationState, Decorator, DecoratorError};
pub use graph::{Edge, EdgeId, ExperimentGraph, ExperimentGraphError, Vertex, VertexId};
pub use plugin::{
    Plugin, PluginArgs, PluginContext, PluginError, PluginRegistry, PluginSignature,
};

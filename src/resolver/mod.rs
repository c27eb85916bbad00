//! Model-component dependency resolution.
//!
//! Given an ordered list of user-selected components, the resolver loads
//! manifests from the repository index, expands transitive component
//! requirements, closes over unsatisfied capability attributes by selecting
//! default providers, and produces a canonical dependency-satisfying order.
//!
//! The order is deterministic: for identical manifests the resolver emits a
//! byte-identical sequence across runs and machines. Cycles are fatal and
//! are reported as rendered chains of alternating attributes and component
//! names.

pub mod graph;
pub mod manager;

pub use graph::{DependencyGraph, DependencyGraphError, EntityId, NodeRef};
pub use manager::{
    ComponentResolver, InitialComponent, PluginArgBag, Resolution, ResolveError,
    ResolvedComponent,
};

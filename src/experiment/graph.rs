//! The experiment-graph arena.
//!
//! Vertices and edges live in a single arena and are referenced by stable
//! integer ids. Deletion invalidates an id without compaction: ids are
//! handed out from monotonic counters and are never reused within the same
//! graph, so a stale id can only miss, never alias.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::schedule::VmSchedule;

use super::decorate::DecorationState;

/// Stable vertex identifier.
pub type VertexId = u64;

/// Stable edge identifier.
pub type EdgeId = u64;

/// Errors raised by graph mutation.
#[derive(Debug, Error, Diagnostic)]
pub enum ExperimentGraphError {
    #[error("vertex {id} does not exist")]
    #[diagnostic(code(embermesh::experiment::unknown_vertex))]
    UnknownVertex { id: VertexId },

    #[error("edge {id} does not exist")]
    #[diagnostic(code(embermesh::experiment::unknown_edge))]
    UnknownEdge { id: EdgeId },
}

/// A graph vertex: a host, router, or switch.
#[derive(Clone, Debug, Default)]
pub struct Vertex {
    /// Experiment-unique VM name, if the vertex is a VM.
    pub name: Option<String>,
    /// Decorations applied so far.
    pub decorations: DecorationState,
    /// Attribute data contributed by decorators and plugins.
    pub attributes: FxHashMap<String, serde_json::Value>,
    /// The VM's timed schedule.
    pub schedule: VmSchedule,
}

/// A graph edge: an undirected link between two vertices.
#[derive(Clone, Debug)]
pub struct Edge {
    pub endpoints: (VertexId, VertexId),
    pub decorations: DecorationState,
    pub attributes: FxHashMap<String, serde_json::Value>,
}

/// Arena of vertices and edges with stable, never-reused ids.
#[derive(Clone, Debug, Default)]
pub struct ExperimentGraph {
    vertices: FxHashMap<VertexId, Vertex>,
    edges: FxHashMap<EdgeId, Edge>,
    vertex_order: Vec<VertexId>,
    edge_order: Vec<EdgeId>,
    next_vertex_id: VertexId,
    next_edge_id: EdgeId,
}

impl ExperimentGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fresh vertex, returning its id.
    pub fn add_vertex(&mut self) -> VertexId {
        let id = self.next_vertex_id;
        self.next_vertex_id += 1;
        self.vertices.insert(id, Vertex::default());
        self.vertex_order.push(id);
        id
    }

    /// Add a named vertex, returning its id.
    pub fn add_named_vertex(&mut self, name: impl Into<String>) -> VertexId {
        let id = self.add_vertex();
        self.vertices
            .get_mut(&id)
            .expect("freshly inserted vertex")
            .name = Some(name.into());
        id
    }

    /// Add an undirected edge between two existing vertices.
    pub fn add_edge(
        &mut self,
        a: VertexId,
        b: VertexId,
    ) -> Result<EdgeId, ExperimentGraphError> {
        self.require_vertex(a)?;
        self.require_vertex(b)?;
        let id = self.next_edge_id;
        self.next_edge_id += 1;
        self.edges.insert(
            id,
            Edge {
                endpoints: (a, b),
                decorations: DecorationState::default(),
                attributes: FxHashMap::default(),
            },
        );
        self.edge_order.push(id);
        Ok(id)
    }

    /// Delete a vertex and its incident edges. The id is never reused.
    pub fn delete_vertex(&mut self, id: VertexId) -> Result<(), ExperimentGraphError> {
        self.require_vertex(id)?;
        self.vertices.remove(&id);
        self.vertex_order.retain(|&v| v != id);
        let incident: Vec<EdgeId> = self
            .edges
            .iter()
            .filter(|(_, edge)| edge.endpoints.0 == id || edge.endpoints.1 == id)
            .map(|(&edge_id, _)| edge_id)
            .collect();
        for edge_id in incident {
            self.edges.remove(&edge_id);
            self.edge_order.retain(|&e| e != edge_id);
        }
        Ok(())
    }

    /// Delete an edge. The id is never reused.
    pub fn delete_edge(&mut self, id: EdgeId) -> Result<(), ExperimentGraphError> {
        if self.edges.remove(&id).is_none() {
            return Err(ExperimentGraphError::UnknownEdge { id });
        }
        self.edge_order.retain(|&e| e != id);
        Ok(())
    }

    #[must_use]
    pub fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(&id)
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> Option<&mut Vertex> {
        self.vertices.get_mut(&id)
    }

    #[must_use]
    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> Option<&mut Edge> {
        self.edges.get_mut(&id)
    }

    /// Vertices in insertion order.
    pub fn vertices(&self) -> impl Iterator<Item = (VertexId, &Vertex)> {
        self.vertex_order
            .iter()
            .filter_map(|id| self.vertices.get(id).map(|vertex| (*id, vertex)))
    }

    /// Edges in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &Edge)> {
        self.edge_order
            .iter()
            .filter_map(|id| self.edges.get(id).map(|edge| (*id, edge)))
    }

    /// Find a vertex by VM name.
    #[must_use]
    pub fn find_vertex_by_name(&self, name: &str) -> Option<VertexId> {
        self.vertices()
            .find(|(_, vertex)| vertex.name.as_deref() == Some(name))
            .map(|(id, _)| id)
    }

    /// Ids of the vertices adjacent to `id`.
    #[must_use]
    pub fn neighbors(&self, id: VertexId) -> Vec<VertexId> {
        self.edges()
            .filter_map(|(_, edge)| {
                if edge.endpoints.0 == id {
                    Some(edge.endpoints.1)
                } else if edge.endpoints.1 == id {
                    Some(edge.endpoints.0)
                } else {
                    None
                }
            })
            .collect()
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn require_vertex(&self, id: VertexId) -> Result<(), ExperimentGraphError> {
        if self.vertices.contains_key(&id) {
            Ok(())
        } else {
            Err(ExperimentGraphError::UnknownVertex { id })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_never_reused_after_delete() {
        let mut graph = ExperimentGraph::new();
        let a = graph.add_vertex();
        let b = graph.add_vertex();
        graph.delete_vertex(a).unwrap();
        let c = graph.add_vertex();
        assert_ne!(c, a);
        assert!(c > b);
        assert!(graph.vertex(a).is_none());
    }

    #[test]
    fn deleting_a_vertex_removes_incident_edges() {
        let mut graph = ExperimentGraph::new();
        let a = graph.add_vertex();
        let b = graph.add_vertex();
        let c = graph.add_vertex();
        let ab = graph.add_edge(a, b).unwrap();
        let bc = graph.add_edge(b, c).unwrap();
        graph.delete_vertex(b).unwrap();
        assert!(graph.edge(ab).is_none());
        assert!(graph.edge(bc).is_none());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn edges_require_existing_vertices() {
        let mut graph = ExperimentGraph::new();
        let a = graph.add_vertex();
        assert!(matches!(
            graph.add_edge(a, 999),
            Err(ExperimentGraphError::UnknownVertex { id: 999 })
        ));
    }

    #[test]
    fn name_lookup() {
        let mut graph = ExperimentGraph::new();
        graph.add_vertex();
        let host = graph.add_named_vertex("host-0");
        assert_eq!(graph.find_vertex_by_name("host-0"), Some(host));
        assert_eq!(graph.find_vertex_by_name("host-1"), None);
    }

    #[test]
    fn neighbors_are_undirected() {
        let mut graph = ExperimentGraph::new();
        let a = graph.add_vertex();
        let b = graph.add_vertex();
        graph.add_edge(a, b).unwrap();
        assert_eq!(graph.neighbors(a), vec![b]);
        assert_eq!(graph.neighbors(b), vec![a]);
    }
}

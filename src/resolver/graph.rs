//! The entity/constraint dependency graph.
//!
//! The graph holds two vertex kinds: *entities* (component instances,
//! identified by integers handed back at insertion) and *constraints*
//! (capability tags, identified by their string names). Edges run
//! constraint→entity when an entity consumes a constraint, entity→constraint
//! when it provides one, and entity→entity for explicit ordering
//! associations. Every vertex carries a *grouping* integer used as the
//! primary tie-break during canonical ordering.
//!
//! The end goal is [`ordered_entities`](DependencyGraph::ordered_entities):
//! a canonical, dependency-satisfying entity order that is identical for
//! identical graphs. Ordering uses a lexicographic topological sort keyed
//! by `(grouping, stringified vertex id)`; entity ids stringify as decimal
//! text and compare *as strings*, matching constraint-name comparison.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::json;
use std::collections::BinaryHeap;
use thiserror::Error;

/// Identifier handed back for an inserted entity.
///
/// Ids are derived from the total vertex count at insertion time and are
/// never reused, so they are unique for the lifetime of the graph.
pub type EntityId = u64;

/// A vertex reference: either an entity id or a constraint name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRef {
    Entity(EntityId),
    Constraint(String),
}

impl NodeRef {
    /// Stringified form used for lexicographic tie-breaks and rendering.
    #[must_use]
    pub fn id_string(&self) -> String {
        match self {
            NodeRef::Entity(id) => id.to_string(),
            NodeRef::Constraint(name) => name.clone(),
        }
    }

    #[must_use]
    pub fn is_entity(&self) -> bool {
        matches!(self, NodeRef::Entity(_))
    }
}

/// Errors raised by graph mutation and ordering.
#[derive(Debug, Error, Diagnostic)]
pub enum DependencyGraphError {
    #[error("identifier {id} does not exist")]
    #[diagnostic(code(embermesh::resolver::unknown_node))]
    UnknownNode { id: String },

    #[error("identifier {id} is not an entity")]
    #[diagnostic(code(embermesh::resolver::not_an_entity))]
    NotAnEntity { id: String },

    /// The graph contains at least one cycle; no valid order exists.
    /// Callers render the offending cycles via
    /// [`simple_cycles`](DependencyGraph::simple_cycles).
    #[error("dependencies cannot be satisfied: the graph contains cycles")]
    #[diagnostic(
        code(embermesh::resolver::unsatisfiable),
        help("Inspect the reported cycles and break one edge per cycle.")
    )]
    Cyclic,
}

#[derive(Clone, Debug)]
struct VertexData {
    is_entity: bool,
    grouping: i64,
}

/// Sort key for the lexicographic topological sort: grouping first
/// (integer comparison), then the stringified vertex id (string
/// comparison).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    grouping: i64,
    id: String,
}

/// Directed dependency graph over entities and constraints.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    vertices: FxHashMap<NodeRef, VertexData>,
    successors: FxHashMap<NodeRef, Vec<NodeRef>>,
    /// Vertex insertion order; drives deterministic iteration.
    insertion: Vec<NodeRef>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity with its constraint edges.
    ///
    /// For each name in `depends` a constraint→entity edge is added; for
    /// each name in `provides`, an entity→constraint edge. Constraints are
    /// created on first mention; their grouping is overwritten to the
    /// inserting entity's grouping.
    pub fn insert_entity(
        &mut self,
        depends: &[String],
        provides: &[String],
        grouping: i64,
    ) -> EntityId {
        let entity_id = (self.vertices.len() as u64) + 1;
        let entity = NodeRef::Entity(entity_id);
        self.add_vertex(entity.clone(), true, grouping);

        for dependency in depends {
            let constraint = NodeRef::Constraint(dependency.clone());
            self.add_vertex(constraint.clone(), false, grouping);
            self.add_edge(constraint, entity.clone());
        }
        for provide in provides {
            let constraint = NodeRef::Constraint(provide.clone());
            self.add_vertex(constraint.clone(), false, grouping);
            self.add_edge(entity.clone(), constraint);
        }

        entity_id
    }

    /// Associate two entities with a directional ordering relationship:
    /// `source` sorts before `dest`.
    pub fn associate_entities(
        &mut self,
        source: EntityId,
        dest: EntityId,
    ) -> Result<(), DependencyGraphError> {
        self.require_entity(source)?;
        self.require_entity(dest)?;
        self.add_edge(NodeRef::Entity(source), NodeRef::Entity(dest));
        Ok(())
    }

    fn require_entity(&self, id: EntityId) -> Result<(), DependencyGraphError> {
        match self.vertices.get(&NodeRef::Entity(id)) {
            None => Err(DependencyGraphError::UnknownNode { id: id.to_string() }),
            Some(data) if !data.is_entity => Err(DependencyGraphError::NotAnEntity {
                id: id.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn add_vertex(&mut self, vertex: NodeRef, is_entity: bool, grouping: i64) {
        match self.vertices.entry(vertex.clone()) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                // Re-mention refreshes the grouping, matching last-inserter-wins.
                occupied.get_mut().grouping = grouping;
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(VertexData {
                    is_entity,
                    grouping,
                });
                self.insertion.push(vertex);
            }
        }
    }

    fn add_edge(&mut self, from: NodeRef, to: NodeRef) {
        let successors = self.successors.entry(from).or_default();
        if !successors.contains(&to) {
            successors.push(to);
        }
    }

    /// Constraints with no producing entity, with their groupings, in
    /// insertion order.
    ///
    /// These are exactly the unsatisfied dependencies the attribute-default
    /// closure must resolve.
    #[must_use]
    pub fn in_degree_zero_constraints(&self) -> Vec<(String, i64)> {
        let mut in_degree: FxHashMap<&NodeRef, usize> = FxHashMap::default();
        for targets in self.successors.values() {
            for target in targets {
                *in_degree.entry(target).or_default() += 1;
            }
        }
        self.insertion
            .iter()
            .filter_map(|vertex| match vertex {
                NodeRef::Constraint(name)
                    if in_degree.get(vertex).copied().unwrap_or(0) == 0 =>
                {
                    Some((name.clone(), self.vertices[vertex].grouping))
                }
                _ => None,
            })
            .collect()
    }

    /// Return entity ids in dependency-valid canonical order.
    ///
    /// The sort is a lexicographic topological sort: among all ready
    /// vertices the one with the smallest `(grouping, id-string)` key runs
    /// first. For a given graph the order is always the same.
    pub fn ordered_entities(&self) -> Result<Vec<EntityId>, DependencyGraphError> {
        let mut in_degree: FxHashMap<NodeRef, usize> = self
            .insertion
            .iter()
            .map(|vertex| (vertex.clone(), 0))
            .collect();
        for targets in self.successors.values() {
            for target in targets {
                *in_degree.entry(target.clone()).or_default() += 1;
            }
        }

        // Min-heap over (grouping, id-string).
        let mut ready: BinaryHeap<std::cmp::Reverse<(OrderKey, NodeRef)>> = self
            .insertion
            .iter()
            .filter(|vertex| in_degree[*vertex] == 0)
            .map(|vertex| std::cmp::Reverse((self.order_key(vertex), vertex.clone())))
            .collect();

        let mut ordering = Vec::new();
        let mut visited = 0usize;
        while let Some(std::cmp::Reverse((_, vertex))) = ready.pop() {
            visited += 1;
            if let NodeRef::Entity(id) = vertex {
                ordering.push(id);
            }
            if let Some(targets) = self.successors.get(&vertex) {
                for target in targets {
                    let degree = in_degree
                        .get_mut(target)
                        .expect("edge target is a known vertex");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(std::cmp::Reverse((self.order_key(target), target.clone())));
                    }
                }
            }
        }

        if visited != self.insertion.len() {
            return Err(DependencyGraphError::Cyclic);
        }
        Ok(ordering)
    }

    fn order_key(&self, vertex: &NodeRef) -> OrderKey {
        OrderKey {
            grouping: self.vertices[vertex].grouping,
            id: vertex.id_string(),
        }
    }

    /// Whether the graph contains at least one cycle.
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        matches!(self.ordered_entities(), Err(DependencyGraphError::Cyclic))
    }

    /// Enumerate every simple cycle in the graph.
    ///
    /// Uses the blocked-set circuit enumeration (Johnson's algorithm
    /// without the strongly-connected-component pre-pass): each cycle is
    /// reported exactly once, starting from its minimum-index vertex.
    #[must_use]
    pub fn simple_cycles(&self) -> Vec<Vec<NodeRef>> {
        let index: FxHashMap<&NodeRef, usize> = self
            .insertion
            .iter()
            .enumerate()
            .map(|(i, vertex)| (vertex, i))
            .collect();
        let n = self.insertion.len();
        let adjacency: Vec<Vec<usize>> = self
            .insertion
            .iter()
            .map(|vertex| {
                self.successors
                    .get(vertex)
                    .map(|targets| targets.iter().map(|t| index[t]).collect())
                    .unwrap_or_default()
            })
            .collect();

        let mut cycles = Vec::new();
        let mut blocked = vec![false; n];
        let mut block_lists: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut stack = Vec::new();

        for start in 0..n {
            for flag in blocked.iter_mut() {
                *flag = false;
            }
            for list in block_lists.iter_mut() {
                list.clear();
            }
            circuit(
                start,
                start,
                &adjacency,
                &mut blocked,
                &mut block_lists,
                &mut stack,
                &mut cycles,
            );
        }

        cycles
            .into_iter()
            .map(|cycle| {
                cycle
                    .into_iter()
                    .map(|i| self.insertion[i].clone())
                    .collect()
            })
            .collect()
    }

    /// Number of vertices (entities plus constraints).
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.insertion.len()
    }

    /// Export the graph in D3 node-link JSON form.
    ///
    /// Links reference vertex ids rather than list positions:
    /// `{"nodes": [{"id", "type", "grouping"}], "links": [{"source",
    /// "target"}], "graph": {}, "directed": true, "multigraph": false}`.
    #[must_use]
    pub fn to_node_link_json(&self) -> serde_json::Value {
        let nodes: Vec<serde_json::Value> = self
            .insertion
            .iter()
            .map(|vertex| {
                let data = &self.vertices[vertex];
                let id = match vertex {
                    NodeRef::Entity(id) => json!(id),
                    NodeRef::Constraint(name) => json!(name),
                };
                json!({
                    "id": id,
                    "type": if data.is_entity { "entity" } else { "constraint" },
                    "grouping": data.grouping,
                })
            })
            .collect();
        let mut links = Vec::new();
        for source in &self.insertion {
            if let Some(targets) = self.successors.get(source) {
                for target in targets {
                    let encode = |vertex: &NodeRef| match vertex {
                        NodeRef::Entity(id) => json!(id),
                        NodeRef::Constraint(name) => json!(name),
                    };
                    links.push(json!({
                        "source": encode(source),
                        "target": encode(target),
                    }));
                }
            }
        }
        json!({
            "nodes": nodes,
            "links": links,
            "graph": {},
            "directed": true,
            "multigraph": false,
        })
    }
}

/// One step of the blocked-set circuit search rooted at `start`.
///
/// Only vertices with index >= `start` participate, which guarantees each
/// cycle is emitted exactly once (from its minimum-index vertex).
fn circuit(
    vertex: usize,
    start: usize,
    adjacency: &[Vec<usize>],
    blocked: &mut [bool],
    block_lists: &mut [Vec<usize>],
    stack: &mut Vec<usize>,
    cycles: &mut Vec<Vec<usize>>,
) -> bool {
    let mut found = false;
    stack.push(vertex);
    blocked[vertex] = true;

    for &next in &adjacency[vertex] {
        if next < start {
            continue;
        }
        if next == start {
            cycles.push(stack.clone());
            found = true;
        } else if !blocked[next]
            && circuit(next, start, adjacency, blocked, block_lists, stack, cycles)
        {
            found = true;
        }
    }

    if found {
        unblock(vertex, blocked, block_lists);
    } else {
        for &next in &adjacency[vertex] {
            if next >= start && !block_lists[next].contains(&vertex) {
                block_lists[next].push(vertex);
            }
        }
    }

    stack.pop();
    found
}

fn unblock(vertex: usize, blocked: &mut [bool], block_lists: &mut [Vec<usize>]) {
    blocked[vertex] = false;
    let waiters = std::mem::take(&mut block_lists[vertex]);
    for waiter in waiters {
        if blocked[waiter] {
            unblock(waiter, blocked, block_lists);
        }
    }
}

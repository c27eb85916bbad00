//! Component resolution: from an initial selection to a canonical order.
//!
//! [`ComponentResolver`] owns the installed-component cache and the
//! attribute-defaults map. [`resolve`](ComponentResolver::resolve) expands
//! the initial selection transitively, closes over unsatisfied attributes
//! by selecting providers, and returns the canonical entity order together
//! with the underlying graph for inspection.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::manifests::{InstalledComponents, ManifestError, ModelComponent, RepositoryIndex};

use super::graph::{DependencyGraph, DependencyGraphError, EntityId, NodeRef};

/// Plugin-argument bag attached to an initial component: the empty key
/// `""` holds the positional-argument list, non-empty keys are named
/// arguments.
pub type PluginArgBag = FxHashMap<String, serde_json::Value>;

/// One entry of the user's initial component selection.
#[derive(Clone, Debug, Default)]
pub struct InitialComponent {
    /// Dotted component name.
    pub name: String,
    /// Plugin arguments forwarded to the component's plugin.
    pub plugin_args: PluginArgBag,
    /// Allow this entry to create a second instance of an already-present
    /// component. Transitive expansion never duplicates.
    pub duplicate: bool,
}

impl InitialComponent {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A component in canonical order, ready for graph building.
#[derive(Clone, Debug)]
pub struct ResolvedComponent {
    pub component: ModelComponent,
    pub entity_id: EntityId,
    pub grouping: i64,
    pub plugin_args: PluginArgBag,
}

/// Output of a successful resolution.
#[derive(Clone, Debug)]
pub struct Resolution {
    ordered: Vec<ResolvedComponent>,
    graph: DependencyGraph,
}

impl Resolution {
    /// Components in canonical, dependency-satisfying order.
    #[must_use]
    pub fn ordered(&self) -> &[ResolvedComponent] {
        &self.ordered
    }

    #[must_use]
    pub fn into_ordered(self) -> Vec<ResolvedComponent> {
        self.ordered
    }

    /// The dependency graph behind the ordering, for inspection and
    /// export.
    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Number of instances of `name` in the resolution.
    #[must_use]
    pub fn occurrences(&self, name: &str) -> usize {
        self.ordered
            .iter()
            .filter(|resolved| resolved.component.name() == name)
            .count()
    }

    /// First instance of `name` in canonical order.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&ResolvedComponent> {
        self.ordered
            .iter()
            .find(|resolved| resolved.component.name() == name)
    }
}

/// Errors raised during resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum ResolveError {
    #[error("model component \"{name}\" is not installed{}", required_by_suffix(.required_by))]
    #[diagnostic(
        code(embermesh::resolver::component_not_found),
        help("Check the repository index and the component's MANIFEST name.")
    )]
    ComponentNotFound {
        name: String,
        required_by: Option<String>,
    },

    #[error("{}", no_default_message(.attribute, .candidates))]
    #[diagnostic(
        code(embermesh::resolver::no_default_provider),
        help("Configure a default provider for the attribute or install exactly one provider.")
    )]
    NoDefaultProvider {
        attribute: String,
        candidates: Vec<String>,
    },

    #[error("configured default \"{name}\" for attribute \"{attribute}\" is invalid: {reason}")]
    #[diagnostic(code(embermesh::resolver::invalid_default_provider))]
    InvalidDefaultProvider {
        attribute: String,
        name: String,
        reason: String,
    },

    #[error("unsatisfiable dependencies: {} circular chain(s) detected", .cycles.len())]
    #[diagnostic(
        code(embermesh::resolver::unsatisfiable),
        help("Break one edge in each rendered chain; chains alternate attributes and components.")
    )]
    UnsatisfiableDependencies {
        /// Human-readable chains of alternating `attribute (Attribute)`
        /// and `name (Model Component)` vertices.
        cycles: Vec<Vec<String>>,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] DependencyGraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),
}

fn required_by_suffix(required_by: &Option<String>) -> String {
    match required_by {
        Some(parent) => format!(" (required by \"{parent}\")"),
        None => String::new(),
    }
}

fn no_default_message(attribute: &str, candidates: &[String]) -> String {
    if candidates.is_empty() {
        format!("no provider found for attribute \"{attribute}\"")
    } else {
        format!(
            "multiple providers and no default found for attribute \"{attribute}\" (candidates: {})",
            candidates.join(", ")
        )
    }
}

/// Resolver over the installed-component cache.
#[derive(Clone, Debug)]
pub struct ComponentResolver {
    installed: InstalledComponents,
    /// attribute name -> default provider component name
    defaults: FxHashMap<String, String>,
}

impl ComponentResolver {
    #[must_use]
    pub fn new(installed: InstalledComponents, defaults: FxHashMap<String, String>) -> Self {
        Self {
            installed,
            defaults,
        }
    }

    /// Discover installed components from the repository index.
    pub fn from_index(
        index: &RepositoryIndex,
        defaults: FxHashMap<String, String>,
    ) -> Result<Self, ResolveError> {
        Ok(Self::new(InstalledComponents::discover(index)?, defaults))
    }

    #[must_use]
    pub fn installed(&self) -> &InstalledComponents {
        &self.installed
    }

    /// Select the provider for an unsatisfied attribute.
    ///
    /// An explicitly configured default wins; it must be installed and
    /// actually provide the attribute. Without a default, a unique
    /// installed provider is selected; zero or several providers fail with
    /// [`ResolveError::NoDefaultProvider`].
    pub fn default_component_for_attribute(
        &self,
        attribute: &str,
    ) -> Result<&ModelComponent, ResolveError> {
        if let Some(default_name) = self.defaults.get(attribute) {
            let component = self.installed.get(default_name).ok_or_else(|| {
                ResolveError::InvalidDefaultProvider {
                    attribute: attribute.to_string(),
                    name: default_name.clone(),
                    reason: "component is not installed".to_string(),
                }
            })?;
            if !component.provides(attribute) {
                return Err(ResolveError::InvalidDefaultProvider {
                    attribute: attribute.to_string(),
                    name: default_name.clone(),
                    reason: "component does not provide the attribute".to_string(),
                });
            }
            return Ok(component);
        }

        let providers = self.installed.providers_of(attribute);
        match providers.as_slice() {
            [single] => Ok(*single),
            _ => Err(ResolveError::NoDefaultProvider {
                attribute: attribute.to_string(),
                candidates: providers.iter().map(|c| c.name().to_string()).collect(),
            }),
        }
    }

    /// Resolve the initial selection into canonical order.
    pub fn resolve(&self, initial: &[InitialComponent]) -> Result<Resolution, ResolveError> {
        let mut build = ResolutionBuild::default();

        // Phase 1: initial components and their transitive requirements,
        // grouped by position in the initial list. Ordering association
        // edges preserve the user's left-to-right intent.
        let mut previous: Option<EntityId> = None;
        for (position, init) in initial.iter().enumerate() {
            let grouping = (position as i64) + 1;
            let component = self.lookup(&init.name, None)?;
            let inserted =
                self.insert_recursive(&mut build, component, grouping, init.duplicate)?;
            let entity_id = match inserted {
                Some(id) => id,
                // Suppressed duplicate: associate against the existing
                // instance so ordering intent still holds.
                None => build
                    .first_by_name(&init.name)
                    .expect("suppressed duplicate implies an existing instance"),
            };
            build.plugin_args.insert(entity_id, init.plugin_args.clone());
            if let Some(prev) = previous {
                build.graph.associate_entities(prev, entity_id)?;
            }
            previous = Some(entity_id);
        }

        // Phase 2: attribute-default closure. Every in-degree-zero
        // constraint lacks a producer; select one and insert it (with its
        // own requirements) under the constraint's grouping. Each round
        // satisfies at least one constraint, so this terminates.
        loop {
            let unsatisfied = build.graph.in_degree_zero_constraints();
            if unsatisfied.is_empty() {
                break;
            }
            for (attribute, grouping) in unsatisfied {
                let provider = self.default_component_for_attribute(&attribute)?;
                tracing::debug!(
                    attribute = %attribute,
                    provider = provider.name(),
                    "selecting default provider for unsatisfied attribute"
                );
                self.insert_recursive(&mut build, provider, grouping, false)?;
            }
        }

        // Phase 3: canonical order.
        let ordering = match build.graph.ordered_entities() {
            Ok(ordering) => ordering,
            Err(DependencyGraphError::Cyclic) => {
                let cycles = render_cycles(&build);
                for cycle in &cycles {
                    tracing::error!(chain = %cycle.join(" -> "), "circular dependency detected");
                }
                return Err(ResolveError::UnsatisfiableDependencies { cycles });
            }
            Err(other) => return Err(other.into()),
        };

        let ordered = ordering
            .into_iter()
            .map(|entity_id| {
                let (component, grouping) = build
                    .components
                    .get(&entity_id)
                    .cloned()
                    .expect("ordered entity was inserted with a component");
                ResolvedComponent {
                    component,
                    entity_id,
                    grouping,
                    plugin_args: build.plugin_args.remove(&entity_id).unwrap_or_default(),
                }
            })
            .collect();

        Ok(Resolution {
            ordered,
            graph: build.graph,
        })
    }

    fn lookup(
        &self,
        name: &str,
        required_by: Option<&str>,
    ) -> Result<&ModelComponent, ResolveError> {
        self.installed
            .get(name)
            .ok_or_else(|| ResolveError::ComponentNotFound {
                name: name.to_string(),
                required_by: required_by.map(str::to_string),
            })
    }

    /// Insert `component` and, depth-first and in declaration order, every
    /// component it requires. Returns `None` when the component was
    /// suppressed as a duplicate.
    fn insert_recursive(
        &self,
        build: &mut ResolutionBuild,
        component: &ModelComponent,
        grouping: i64,
        duplicate: bool,
    ) -> Result<Option<EntityId>, ResolveError> {
        if !duplicate && build.occurrences(component.name()) > 0 {
            tracing::debug!(name = component.name(), "not inserting duplicate component");
            return Ok(None);
        }

        let (depends, provides, _precedes) = component.attributes();
        let entity_id = build.graph.insert_entity(depends, provides, grouping);
        build
            .components
            .insert(entity_id, (component.clone(), grouping));
        build
            .insertion_order
            .push((component.name().to_string(), entity_id));

        for required in component.required_components() {
            let child = self.lookup(required, Some(component.name()))?;
            self.insert_recursive(build, child, grouping, false)?;
        }
        Ok(Some(entity_id))
    }
}

#[derive(Debug, Default)]
struct ResolutionBuild {
    graph: DependencyGraph,
    components: FxHashMap<EntityId, (ModelComponent, i64)>,
    insertion_order: Vec<(String, EntityId)>,
    plugin_args: FxHashMap<EntityId, PluginArgBag>,
}

impl ResolutionBuild {
    fn occurrences(&self, name: &str) -> usize {
        self.insertion_order
            .iter()
            .filter(|(existing, _)| existing == name)
            .count()
    }

    fn first_by_name(&self, name: &str) -> Option<EntityId> {
        self.insertion_order
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, id)| *id)
    }
}

/// Render each simple cycle as a chain of alternating
/// `attribute (Attribute)` and `name (Model Component)` labels.
fn render_cycles(build: &ResolutionBuild) -> Vec<Vec<String>> {
    build
        .graph
        .simple_cycles()
        .into_iter()
        .map(|cycle| {
            cycle
                .into_iter()
                .map(|vertex| match vertex {
                    NodeRef::Constraint(name) => format!("{name} (Attribute)"),
                    NodeRef::Entity(id) => {
                        let name = build
                            .components
                            .get(&id)
                            .map(|(component, _)| component.name().to_string())
                            .unwrap_or_else(|| id.to_string());
                        format!("{name} (Model Component)")
                    }
                })
                .collect()
        })
        .collect()
}

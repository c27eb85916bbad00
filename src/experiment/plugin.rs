//! Plugins: the per-component entry points that mutate the experiment
//! graph.
//!
//! Components register their plugin and their decorator set ("objects") in
//! an explicit [`PluginRegistry`] keyed by component name; the builder
//! invokes plugins in canonical order. Plugin arguments arrive as a bag
//! where the empty key `""` is the positional-argument list and every other
//! key is a named argument; unknown named arguments and missing positionals
//! are fatal.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::resolver::PluginArgBag;

use super::decorate::{Decorator, DecoratorError};
use super::graph::{ExperimentGraph, ExperimentGraphError};

/// Errors raised while binding arguments or running plugins.
#[derive(Debug, Error, Diagnostic)]
pub enum PluginError {
    #[error(
        "model component \"{component}\" is not available here; \
         component used but not listed as a required component"
    )]
    #[diagnostic(
        code(embermesh::plugin::model_component_import),
        help("Add the component to this component's `model_components.depends` list.")
    )]
    ModelComponentImport { component: String },

    #[error("no plugin registered for component \"{component}\"")]
    #[diagnostic(code(embermesh::plugin::unregistered))]
    UnregisteredPlugin { component: String },

    #[error("unknown named argument \"{name}\" for plugin \"{component}\"")]
    #[diagnostic(code(embermesh::plugin::unknown_argument))]
    UnknownNamedArgument { component: String, name: String },

    #[error(
        "plugin \"{component}\" requires {required} positional argument(s), got {provided}"
    )]
    #[diagnostic(code(embermesh::plugin::missing_positional))]
    MissingPositional {
        component: String,
        required: usize,
        provided: usize,
    },

    #[error("component \"{component}\" references decorator \"{decorator}\" which does not exist")]
    #[diagnostic(code(embermesh::plugin::unknown_decorator))]
    UnknownDecorator {
        component: String,
        decorator: String,
    },

    #[error("missing VM resource \"{file}\" declared by component \"{component}\"")]
    #[diagnostic(
        code(embermesh::plugin::missing_vm_resource),
        help("The file must exist inside the component directory.")
    )]
    MissingVmResource { component: String, file: String },

    #[error("missing image \"{image}\" declared by component \"{component}\"")]
    #[diagnostic(code(embermesh::plugin::missing_image))]
    MissingImage { component: String, image: String },

    #[error("plugin \"{component}\" failed: {message}")]
    #[diagnostic(code(embermesh::plugin::runtime))]
    Runtime { component: String, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Decorator(#[from] DecoratorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] ExperimentGraphError),
}

/// Declared argument shape of a plugin.
#[derive(Clone, Debug, Default)]
pub struct PluginSignature {
    /// Number of required positional arguments.
    pub required_positional: usize,
    /// Named arguments the plugin accepts.
    pub named: Vec<String>,
}

impl PluginSignature {
    #[must_use]
    pub fn positional(count: usize) -> Self {
        Self {
            required_positional: count,
            named: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_named(mut self, name: impl Into<String>) -> Self {
        self.named.push(name.into());
        self
    }
}

/// Bound plugin arguments.
#[derive(Clone, Debug, Default)]
pub struct PluginArgs {
    positional: Vec<serde_json::Value>,
    named: FxHashMap<String, serde_json::Value>,
}

impl PluginArgs {
    /// Split a raw argument bag: the `""` key is the positional list,
    /// everything else is named.
    #[must_use]
    pub fn from_bag(bag: &PluginArgBag) -> Self {
        let mut args = PluginArgs::default();
        for (key, value) in bag {
            if key.is_empty() {
                match value {
                    serde_json::Value::Array(items) => {
                        args.positional = items.clone();
                    }
                    other => args.positional = vec![other.clone()],
                }
            } else {
                args.named.insert(key.clone(), value.clone());
            }
        }
        args
    }

    /// Validate this bag against a plugin's declared signature.
    pub fn bind(&self, component: &str, signature: &PluginSignature) -> Result<(), PluginError> {
        if self.positional.len() < signature.required_positional {
            return Err(PluginError::MissingPositional {
                component: component.to_string(),
                required: signature.required_positional,
                provided: self.positional.len(),
            });
        }
        for name in self.named.keys() {
            if !signature.named.iter().any(|allowed| allowed == name) {
                return Err(PluginError::UnknownNamedArgument {
                    component: component.to_string(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn positional(&self) -> &[serde_json::Value] {
        &self.positional
    }

    #[must_use]
    pub fn named(&self, name: &str) -> Option<&serde_json::Value> {
        self.named.get(name)
    }

    /// Positional argument `index` as a string, if present.
    #[must_use]
    pub fn positional_str(&self, index: usize) -> Option<&str> {
        self.positional.get(index).and_then(|v| v.as_str())
    }
}

/// A component's entry point. Invoked once, in canonical order, with the
/// shared graph.
pub trait Plugin: Send + Sync {
    /// Declared argument shape; the builder validates bags against it
    /// before invoking.
    fn signature(&self) -> PluginSignature {
        PluginSignature::default()
    }

    /// Mutate the experiment graph.
    fn invoke(
        &self,
        graph: &mut ExperimentGraph,
        ctx: &mut PluginContext<'_>,
        args: &PluginArgs,
    ) -> Result<(), PluginError>;
}

/// Registry of plugins and decorator sets, keyed by component name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: FxHashMap<String, Arc<dyn Plugin>>,
    objects: FxHashMap<String, Vec<Decorator>>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component's plugin.
    pub fn register_plugin(&mut self, component: impl Into<String>, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(component.into(), plugin);
    }

    /// Register a component's decorator set.
    pub fn register_objects(&mut self, component: impl Into<String>, objects: Vec<Decorator>) {
        self.objects.insert(component.into(), objects);
    }

    #[must_use]
    pub fn plugin(&self, component: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(component)
    }

    #[must_use]
    pub fn objects(&self, component: &str) -> Option<&[Decorator]> {
        self.objects.get(component).map(Vec::as_slice)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("objects", &self.objects.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Per-build view handed to plugins: decorator lookup scoped to the
/// components whose objects have been loaded so far.
pub struct PluginContext<'a> {
    registry: &'a PluginRegistry,
    loaded: FxHashSet<String>,
}

impl<'a> PluginContext<'a> {
    #[must_use]
    pub fn new(registry: &'a PluginRegistry) -> Self {
        Self {
            registry,
            loaded: FxHashSet::default(),
        }
    }

    /// Mark a component's objects as loaded (builder-internal).
    pub(crate) fn mark_loaded(&mut self, component: &str) {
        self.loaded.insert(component.to_string());
    }

    /// Whether a component's objects are available to plugins.
    #[must_use]
    pub fn is_loaded(&self, component: &str) -> bool {
        self.loaded.contains(component)
    }

    /// Look up a decorator contributed by `component`.
    ///
    /// Referencing a component whose objects have not been loaded is the
    /// classic "used but not required" mistake and fails with
    /// [`PluginError::ModelComponentImport`].
    pub fn decorator(
        &self,
        component: &str,
        decorator: &str,
    ) -> Result<&Decorator, PluginError> {
        if !self.loaded.contains(component) {
            return Err(PluginError::ModelComponentImport {
                component: component.to_string(),
            });
        }
        self.registry
            .objects(component)
            .and_then(|objects| objects.iter().find(|d| d.name == decorator))
            .ok_or_else(|| PluginError::UnknownDecorator {
                component: component.to_string(),
                decorator: decorator.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(entries: &[(&str, serde_json::Value)]) -> PluginArgBag {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn empty_key_is_positional() {
        let args = PluginArgs::from_bag(&bag(&[
            ("", json!(["one", "two"])),
            ("mode", json!("fast")),
        ]));
        assert_eq!(args.positional_str(0), Some("one"));
        assert_eq!(args.positional_str(1), Some("two"));
        assert_eq!(args.named("mode"), Some(&json!("fast")));
    }

    #[test]
    fn missing_positional_is_fatal() {
        let args = PluginArgs::from_bag(&bag(&[("", json!(["only"]))]));
        let signature = PluginSignature::positional(2);
        assert!(matches!(
            args.bind("tests.plugin", &signature),
            Err(PluginError::MissingPositional {
                required: 2,
                provided: 1,
                ..
            })
        ));
    }

    #[test]
    fn unknown_named_argument_is_fatal() {
        let args = PluginArgs::from_bag(&bag(&[("bogus", json!(1))]));
        let signature = PluginSignature::default();
        assert!(matches!(
            args.bind("tests.plugin", &signature),
            Err(PluginError::UnknownNamedArgument { .. })
        ));
    }

    #[test]
    fn context_gates_decorator_access() {
        let mut registry = PluginRegistry::new();
        registry.register_objects("base.objects", vec![Decorator::named("vm")]);

        let mut ctx = PluginContext::new(&registry);
        assert!(matches!(
            ctx.decorator("base.objects", "vm"),
            Err(PluginError::ModelComponentImport { .. })
        ));

        ctx.mark_loaded("base.objects");
        assert!(ctx.decorator("base.objects", "vm").is_ok());
        assert!(matches!(
            ctx.decorator("base.objects", "missing"),
            Err(PluginError::UnknownDecorator { .. })
        ));
    }
}

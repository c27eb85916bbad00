//! The experiment-graph builder: ordered plugin invocation with
//! per-component error reports.
//!
//! The builder walks the resolver's canonical order. For each component it
//! loads the component's decorator set (making it visible to later
//! plugins), validates declared VM resources, then binds arguments and
//! invokes the plugin against the shared graph. A failing component is
//! recorded in its report and does not abort the walk; subsequent
//! components still run.

use std::time::Instant;

use crate::resolver::ResolvedComponent;

use super::graph::ExperimentGraph;
use super::plugin::{PluginArgs, PluginContext, PluginError, PluginRegistry};

/// Outcome of one component's build step.
#[derive(Debug)]
pub struct BuildReport {
    /// Component name.
    pub component: String,
    /// Whether the step recorded any error.
    pub errors: bool,
    /// Wall-clock seconds spent in the step.
    pub time_secs: f64,
    /// The recorded error, when `errors` is true.
    pub error: Option<PluginError>,
}

/// Walks the canonical component order against a shared graph.
pub struct ExperimentBuilder {
    registry: PluginRegistry,
}

impl ExperimentBuilder {
    #[must_use]
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Build the experiment graph, returning one report per component in
    /// walk order.
    ///
    /// Reports never short-circuit: every component gets a report whether
    /// or not earlier components failed. Callers that need fail-fast
    /// behavior check [`BuildReport::errors`] on the returned list.
    pub fn build(
        &self,
        ordered: &[ResolvedComponent],
        graph: &mut ExperimentGraph,
    ) -> Vec<BuildReport> {
        let mut ctx = PluginContext::new(&self.registry);
        let mut reports = Vec::with_capacity(ordered.len());

        for resolved in ordered {
            let component = &resolved.component;
            let name = component.name().to_string();
            let started = Instant::now();
            let mut error: Option<PluginError> = None;

            // Objects first: decorator sets must be visible to this and
            // every later plugin. A missing registration is recoverable;
            // the component is reported and the walk continues.
            if component.objects().is_some() {
                if self.registry.objects(&name).is_some() {
                    ctx.mark_loaded(&name);
                } else {
                    tracing::warn!(
                        component = %name,
                        "objects declared in manifest but not registered"
                    );
                    error = Some(PluginError::ModelComponentImport {
                        component: name.clone(),
                    });
                }
            }

            // Declared VM resources must exist inside the component
            // directory before any schedule can reference them.
            if error.is_none() {
                for file in component.vm_resources() {
                    if !component.vm_resource_path(file).exists() {
                        error = Some(PluginError::MissingVmResource {
                            component: name.clone(),
                            file: file.clone(),
                        });
                        break;
                    }
                }
            }

            if error.is_none() && component.plugin().is_some() {
                error = self.invoke_plugin(resolved, graph, &mut ctx).err();
            }

            let errors = error.is_some();
            if let Some(err) = &error {
                tracing::error!(component = %name, error = %err, "component build step failed");
            }
            reports.push(BuildReport {
                component: name,
                errors,
                time_secs: started.elapsed().as_secs_f64(),
                error,
            });
        }

        reports
    }

    fn invoke_plugin(
        &self,
        resolved: &ResolvedComponent,
        graph: &mut ExperimentGraph,
        ctx: &mut PluginContext<'_>,
    ) -> Result<(), PluginError> {
        let name = resolved.component.name();
        let plugin = self
            .registry
            .plugin(name)
            .ok_or_else(|| PluginError::UnregisteredPlugin {
                component: name.to_string(),
            })?
            .clone();

        let args = PluginArgs::from_bag(&resolved.plugin_args);
        args.bind(name, &plugin.signature())?;
        tracing::debug!(component = %name, "invoking plugin");
        plugin.invoke(graph, ctx, &args)
    }
}

/// Whether any report in a build recorded an error.
#[must_use]
pub fn any_errors(reports: &[BuildReport]) -> bool {
    reports.iter().any(|report| report.errors)
}

//! Model-component manifests.
//!
//! Each component directory carries a `MANIFEST` YAML file declaring the
//! component's dotted name, the capability attributes it depends on and
//! provides, the components it requires, and optional plugin / objects /
//! image / VM-resource entries. Components are immutable once parsed and
//! are cached by name for the duration of an experiment.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::repository::{RepositoryError, RepositoryIndex};

/// File name marking a component directory.
pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

/// Capability attributes of a component.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComponentAttributes {
    /// Capability tags this component consumes.
    pub depends: Vec<String>,
    /// Capability tags this component provides.
    pub provides: Vec<String>,
    /// Precedence hints: tags this component wants ordered after itself.
    pub precedes: Vec<String>,
}

/// Components this component transitively requires, in order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComponentDependencies {
    pub depends: Vec<String>,
    pub precedes: Vec<String>,
}

/// Parsed `MANIFEST` contents.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    /// Unique dotted name, e.g. `tests.vm_gen`.
    pub name: String,
    #[serde(default)]
    pub attributes: ComponentAttributes,
    #[serde(default)]
    pub model_components: ComponentDependencies,
    /// Plugin entry point name, registered in the plugin registry.
    #[serde(default)]
    pub plugin: Option<String>,
    /// Objects (decorator set) entry point name.
    #[serde(default)]
    pub model_component_objects: Option<String>,
    /// VM image names contributed by this component.
    #[serde(default)]
    pub images: Vec<String>,
    /// VM-resource file names contributed by this component, relative to
    /// the component directory.
    #[serde(default)]
    pub vm_resources: Vec<String>,
}

/// Errors raised while loading manifests.
#[derive(Debug, Error, Diagnostic)]
pub enum ManifestError {
    #[error("no {MANIFEST_FILE_NAME} file in component directory {path}")]
    #[diagnostic(code(embermesh::manifest::missing))]
    Missing { path: PathBuf },

    #[error("failed to read manifest at {path}: {source}")]
    #[diagnostic(code(embermesh::manifest::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed manifest at {path}: {source}")]
    #[diagnostic(
        code(embermesh::manifest::parse),
        help("The manifest must be YAML with at least a `name` key.")
    )]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Repository(#[from] RepositoryError),
}

/// A model component: manifest plus its installation path.
#[derive(Clone, Debug)]
pub struct ModelComponent {
    manifest: Manifest,
    path: PathBuf,
}

impl ModelComponent {
    /// Load the component rooted at `path` (the directory containing the
    /// `MANIFEST` file).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let path = path.into();
        let manifest_path = path.join(MANIFEST_FILE_NAME);
        if !manifest_path.exists() {
            return Err(ManifestError::Missing { path });
        }
        let raw = std::fs::read_to_string(&manifest_path).map_err(|source| ManifestError::Io {
            path: manifest_path.clone(),
            source,
        })?;
        let manifest =
            serde_yaml::from_str(&raw).map_err(|source| ManifestError::Parse {
                path: manifest_path,
                source,
            })?;
        Ok(Self { manifest, path })
    }

    /// The component's unique dotted name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Installation directory of the component.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `(depends, provides, precedes)` attribute sets.
    #[must_use]
    pub fn attributes(&self) -> (&[String], &[String], &[String]) {
        let attrs = &self.manifest.attributes;
        (&attrs.depends, &attrs.provides, &attrs.precedes)
    }

    /// Names of components this one requires, in declaration order.
    #[must_use]
    pub fn required_components(&self) -> &[String] {
        &self.manifest.model_components.depends
    }

    /// Whether this component provides the given attribute.
    #[must_use]
    pub fn provides(&self, attribute: &str) -> bool {
        self.manifest
            .attributes
            .provides
            .iter()
            .any(|p| p == attribute)
    }

    /// Plugin entry name, if the component has one.
    #[must_use]
    pub fn plugin(&self) -> Option<&str> {
        self.manifest.plugin.as_deref()
    }

    /// Objects (decorator set) entry name, if the component has one.
    #[must_use]
    pub fn objects(&self) -> Option<&str> {
        self.manifest.model_component_objects.as_deref()
    }

    /// VM image names contributed by this component.
    #[must_use]
    pub fn images(&self) -> &[String] {
        &self.manifest.images
    }

    /// VM-resource file names contributed by this component.
    #[must_use]
    pub fn vm_resources(&self) -> &[String] {
        &self.manifest.vm_resources
    }

    /// Absolute path of a VM-resource file inside the component directory.
    #[must_use]
    pub fn vm_resource_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

/// Cache of every component reachable from the repository index.
///
/// Repositories are walked in index order; within a root, component
/// directories are visited in sorted order so the cache contents are
/// deterministic. The first component seen under a given name wins.
#[derive(Clone, Debug, Default)]
pub struct InstalledComponents {
    by_name: FxHashMap<String, ModelComponent>,
    names: Vec<String>,
}

impl InstalledComponents {
    /// Walk every root in the index and cache each component by name.
    pub fn discover(index: &RepositoryIndex) -> Result<Self, ManifestError> {
        let mut installed = Self::default();
        for root in index.list()? {
            if !root.exists() {
                tracing::warn!(root = %root.display(), "skipping missing repository root");
                continue;
            }
            for dir in component_dirs(&root) {
                let component = ModelComponent::load(&dir)?;
                installed.insert(component);
            }
        }
        Ok(installed)
    }

    fn insert(&mut self, component: ModelComponent) {
        let name = component.name().to_string();
        if self.by_name.contains_key(&name) {
            tracing::debug!(
                %name,
                path = %component.path().display(),
                "component name already installed; keeping the first occurrence"
            );
            return;
        }
        self.names.push(name.clone());
        self.by_name.insert(name, component);
    }

    /// Look up a component by dotted name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ModelComponent> {
        self.by_name.get(name)
    }

    /// Every installed component, in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &ModelComponent> {
        self.names.iter().filter_map(|name| self.by_name.get(name))
    }

    /// All installed components providing `attribute`, in discovery order.
    #[must_use]
    pub fn providers_of(&self, attribute: &str) -> Vec<&ModelComponent> {
        self.iter().filter(|c| c.provides(attribute)).collect()
    }

    /// Number of installed components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Find component directories under `root`.
///
/// A directory containing a `MANIFEST` file is a component; the walk does
/// not descend into component directories, so nested trees only contribute
/// their outermost manifest. Children are visited in sorted order for
/// deterministic discovery.
fn component_dirs(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if dir.join(MANIFEST_FILE_NAME).is_file() {
            found.push(dir);
            continue;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            tracing::warn!(dir = %dir.display(), "unreadable directory in repository walk");
            continue;
        };
        let mut children: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        children.sort();
        // Reverse so the stack pops children in sorted order.
        for child in children.into_iter().rev() {
            stack.push(child);
        }
    }
    found.sort();
    found
}

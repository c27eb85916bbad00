//! Model-component manifests and the repository index.
//!
//! A *repository* is a filesystem tree whose leaf directories containing a
//! `MANIFEST` file are model components. Installed repositories are listed
//! in a small JSON index file; [`InstalledComponents`] walks every indexed
//! root and caches each parsed component by its dotted name.

pub mod component;
pub mod repository;

pub use component::{
    ComponentAttributes, InstalledComponents, Manifest, ManifestError, ModelComponent,
    MANIFEST_FILE_NAME,
};
pub use repository::{RepositoryError, RepositoryIndex};

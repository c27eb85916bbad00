//! The repository index: a persistent, deduplicated set of repository
//! roots.
//!
//! The index is a JSON array of `{"path": "..."}` objects stored at a
//! well-known location. Entries are validated on every touch: the object
//! must carry exactly the `path` key, and the path must exist and be
//! readable. Deleting a path that no longer exists on disk is a warning,
//! not an error.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single index entry. Exactly one key is allowed, enforced by
/// `deny_unknown_fields`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct RepositoryEntry {
    path: String,
}

/// Errors raised by [`RepositoryIndex`] operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RepositoryError {
    #[error("repository entry is malformed: {reason}")]
    #[diagnostic(
        code(embermesh::repository::malformed),
        help("Each index entry must be an object with exactly one key, \"path\".")
    )]
    Malformed { reason: String },

    #[error("repository path does not exist: {path}")]
    #[diagnostic(
        code(embermesh::repository::not_found),
        help("Create the directory before adding it as a repository.")
    )]
    PathNotFound { path: PathBuf },

    #[error("repository path is not readable: {path}")]
    #[diagnostic(code(embermesh::repository::not_readable))]
    PathNotReadable { path: PathBuf },

    #[error("failed to read or write the repository index at {path}: {source}")]
    #[diagnostic(code(embermesh::repository::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Persistent index of repository roots.
///
/// The backing file is created empty (`[]`) on first use. A corrupt index
/// file is treated as empty with a warning so one bad write cannot brick
/// component resolution.
#[derive(Clone, Debug)]
pub struct RepositoryIndex {
    index_file: PathBuf,
}

impl RepositoryIndex {
    /// Open (creating if needed) the index at `index_file`.
    pub fn open(index_file: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let index_file = index_file.into();
        if let Some(parent) = index_file.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RepositoryError::Io {
                path: index_file.clone(),
                source,
            })?;
        }
        if !index_file.exists() {
            write_entries(&index_file, &[])?;
        }
        Ok(Self { index_file })
    }

    /// List the registered repository roots, in index order.
    ///
    /// Malformed entries are skipped with a warning.
    pub fn list(&self) -> Result<Vec<PathBuf>, RepositoryError> {
        Ok(self
            .read_entries()?
            .into_iter()
            .map(|entry| PathBuf::from(entry.path))
            .collect())
    }

    /// Add a repository root.
    ///
    /// Returns the number of entries added: 0 for a duplicate path, 1
    /// otherwise. The path must exist and be readable.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<usize, RepositoryError> {
        let path = path.as_ref();
        validate_path(path)?;

        let mut entries = self.read_entries()?;
        let canonical = path.to_string_lossy().to_string();
        if entries.iter().any(|entry| entry.path == canonical) {
            tracing::debug!(path = %canonical, "ignoring duplicate repository");
            return Ok(0);
        }
        entries.push(RepositoryEntry { path: canonical });
        write_entries(&self.index_file, &entries)?;
        Ok(1)
    }

    /// Delete a repository root.
    ///
    /// Returns the number of entries removed (0 or 1). A registered path
    /// that no longer exists on disk is still removed, with a warning.
    pub fn delete(&self, path: impl AsRef<Path>) -> Result<usize, RepositoryError> {
        let path = path.as_ref();
        let target = path.to_string_lossy().to_string();

        let mut entries = self.read_entries()?;
        let before = entries.len();
        entries.retain(|entry| entry.path != target);
        if entries.len() == before {
            tracing::debug!(path = %target, "repository was not registered; nothing removed");
            return Ok(0);
        }
        if !path.exists() {
            tracing::warn!(path = %target, "repository path no longer exists; removed anyway");
        }
        write_entries(&self.index_file, &entries)?;
        Ok(1)
    }

    /// Location of the backing file.
    #[must_use]
    pub fn index_file(&self) -> &Path {
        &self.index_file
    }

    fn read_entries(&self) -> Result<Vec<RepositoryEntry>, RepositoryError> {
        let raw = std::fs::read_to_string(&self.index_file).map_err(|source| {
            RepositoryError::Io {
                path: self.index_file.clone(),
                source,
            }
        })?;
        match serde_json::from_str::<Vec<serde_json::Value>>(&raw) {
            Ok(values) => Ok(values
                .into_iter()
                .filter_map(|value| match serde_json::from_value(value) {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping malformed repository entry");
                        None
                    }
                })
                .collect()),
            Err(err) => {
                tracing::warn!(error = %err, "repository index unable to be read; treating as empty");
                Ok(Vec::new())
            }
        }
    }
}

fn validate_path(path: &Path) -> Result<(), RepositoryError> {
    if !path.exists() {
        return Err(RepositoryError::PathNotFound {
            path: path.to_path_buf(),
        });
    }
    if std::fs::read_dir(path).is_err() {
        return Err(RepositoryError::PathNotReadable {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn write_entries(file: &Path, entries: &[RepositoryEntry]) -> Result<(), RepositoryError> {
    let body = serde_json::to_string(entries).expect("repository entries always serialize");
    std::fs::write(file, body).map_err(|source| RepositoryError::Io {
        path: file.to_path_buf(),
        source,
    })
}

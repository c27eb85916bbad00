//! The content-addressed object store.
//!
//! Blobs live under a root directory shared across cluster nodes, keyed by
//! file name. Each blob carries sidecar metadata (SHA-1 digest, size,
//! upload date, source mtime) under `.meta/`. Writers take an advisory
//! per-name lock by atomically creating a sibling `<name>-lock` directory;
//! a second writer fails fast while the lock exists. Readers never lock.
//!
//! `put` compares the incoming file against the stored entry: identical
//! mtime and digest is a no-op, identical digest with a newer mtime only
//! refreshes metadata, a differing digest replaces the blob, and an absent
//! entry inserts it. After a local write on a coordinator node the blob is
//! propagated to every configured peer root so agents anywhere can open it
//! by name.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::hash::{hash_bytes, hash_file};

const META_DIR: &str = ".meta";
const LOCK_SUFFIX: &str = "-lock";

/// Result of a `put` operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The name was absent; the blob was inserted.
    NoDate,
    /// Stored content already matches; at most metadata was refreshed.
    SameHash,
    /// Content differed; the blob was replaced.
    NewHash,
}

/// Errors raised by store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("no object named \"{name}\" in the store")]
    #[diagnostic(code(embermesh::store::not_found))]
    NotFound { name: String },

    #[error("object \"{name}\" is locked by another writer")]
    #[diagnostic(
        code(embermesh::store::locked),
        help("A concurrent put holds the lock; retry after it completes.")
    )]
    Locked { name: String },

    #[error("invalid object name \"{name}\"")]
    #[diagnostic(code(embermesh::store::bad_name))]
    BadName { name: String },

    #[error("store I/O error at {path}: {source}")]
    #[diagnostic(code(embermesh::store::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt metadata for \"{name}\": {source}")]
    #[diagnostic(code(embermesh::store::metadata))]
    Metadata {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid glob pattern \"{pattern}\": {source}")]
    #[diagnostic(code(embermesh::store::pattern))]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ObjectMetadata {
    hash: String,
    size: u64,
    upload_date: DateTime<Utc>,
    /// Modification time of the source file at put time, in milliseconds
    /// since the epoch. Absent for byte-puts.
    source_mtime_ms: Option<i64>,
}

/// Read handle for a stored blob: the local path plus convenience reads.
#[derive(Clone, Debug)]
pub struct StoreFile {
    path: PathBuf,
}

impl StoreFile {
    /// Local filesystem path of the blob.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full blob contents.
    pub async fn read(&self) -> Result<Vec<u8>, StoreError> {
        tokio::fs::read(&self.path).await.map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Open the blob for streaming reads.
    pub async fn open(&self) -> Result<tokio::fs::File, StoreError> {
        tokio::fs::File::open(&self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

/// The store itself. Cheap to clone; clones share the same root.
#[derive(Clone, Debug)]
pub struct ObjectStore {
    root: PathBuf,
    peers: Vec<PathBuf>,
}

impl ObjectStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_peers(root, Vec::new())
    }

    /// Open a store that broadcasts writes to `peers`.
    pub fn open_with_peers(
        root: impl Into<PathBuf>,
        peers: Vec<PathBuf>,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        let meta = root.join(META_DIR);
        std::fs::create_dir_all(&meta).map_err(|source| StoreError::Io {
            path: meta,
            source,
        })?;
        Ok(Self { root, peers })
    }

    /// Root directory of this replica.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Insert or update a blob from a local file. The stored name is the
    /// file's base name.
    pub async fn put_file(&self, path: &Path, broadcast: bool) -> Result<PutOutcome, StoreError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::BadName {
                name: path.display().to_string(),
            })?
            .to_string();
        let bytes = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mtime_ms = file_mtime_ms(path);
        let digest = hash_file(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.put_inner(&name, &bytes, digest, mtime_ms, broadcast)
            .await
    }

    /// Insert or update a blob from raw bytes under an explicit name.
    pub async fn put_bytes(
        &self,
        name: &str,
        bytes: &[u8],
        broadcast: bool,
    ) -> Result<PutOutcome, StoreError> {
        check_name(name)?;
        let digest = hash_bytes(bytes);
        self.put_inner(name, bytes, digest, None, broadcast).await
    }

    async fn put_inner(
        &self,
        name: &str,
        bytes: &[u8],
        digest: String,
        source_mtime_ms: Option<i64>,
        broadcast: bool,
    ) -> Result<PutOutcome, StoreError> {
        let _lock = LockGuard::acquire(&self.root, name)?;

        let existing = self.read_metadata(name)?;
        let outcome = match &existing {
            None => PutOutcome::NoDate,
            Some(meta) if meta.hash == digest => {
                if meta.source_mtime_ms == source_mtime_ms {
                    tracing::debug!(%name, "put is a no-op: same hash, same mtime");
                    return Ok(PutOutcome::SameHash);
                }
                // Content identical, timestamp moved: refresh metadata only.
                let refreshed = ObjectMetadata {
                    source_mtime_ms,
                    upload_date: Utc::now(),
                    ..meta.clone()
                };
                self.write_metadata(name, &refreshed)?;
                if broadcast {
                    self.broadcast(name).await?;
                }
                return Ok(PutOutcome::SameHash);
            }
            Some(_) => PutOutcome::NewHash,
        };

        let blob_path = self.root.join(name);
        tokio::fs::write(&blob_path, bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: blob_path,
                source,
            })?;
        self.write_metadata(
            name,
            &ObjectMetadata {
                hash: digest,
                size: bytes.len() as u64,
                upload_date: Utc::now(),
                source_mtime_ms,
            },
        )?;
        if broadcast {
            self.broadcast(name).await?;
        }
        tracing::debug!(%name, ?outcome, size = bytes.len(), "stored object");
        Ok(outcome)
    }

    /// Fetch a blob by name.
    pub fn get(&self, name: &str) -> Result<StoreFile, StoreError> {
        check_name(name)?;
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(StoreError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(StoreFile { path })
    }

    /// Distinct stored names matching `pattern` (all names when `None`),
    /// sorted.
    pub fn list(&self, pattern: Option<&str>) -> Result<Vec<String>, StoreError> {
        let matcher = compile_pattern(pattern)?;
        let entries = std::fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| match &matcher {
                Some(pattern) => pattern.matches(name),
                None => true,
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Remove every blob matching `pattern`.
    pub fn remove(&self, pattern: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for name in self.list(Some(pattern))? {
            let blob_path = self.root.join(&name);
            std::fs::remove_file(&blob_path).map_err(|source| StoreError::Io {
                path: blob_path,
                source,
            })?;
            let meta_path = self.metadata_path(&name);
            if meta_path.exists() {
                std::fs::remove_file(&meta_path).map_err(|source| StoreError::Io {
                    path: meta_path,
                    source,
                })?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Stored content digest, or the empty string for an unknown name.
    pub fn hash(&self, name: &str) -> Result<String, StoreError> {
        Ok(self
            .read_metadata(name)?
            .map(|meta| meta.hash)
            .unwrap_or_default())
    }

    /// Upload date, or `None` for an unknown name.
    pub fn upload_date(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.read_metadata(name)?.map(|meta| meta.upload_date))
    }

    /// Stored size in bytes. Unknown names are an error.
    pub fn size(&self, name: &str) -> Result<u64, StoreError> {
        self.read_metadata(name)?
            .map(|meta| meta.size)
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })
    }

    /// Copy a blob and its metadata to every peer root.
    async fn broadcast(&self, name: &str) -> Result<(), StoreError> {
        for peer in &self.peers {
            let peer_meta = peer.join(META_DIR);
            tokio::fs::create_dir_all(&peer_meta)
                .await
                .map_err(|source| StoreError::Io {
                    path: peer_meta.clone(),
                    source,
                })?;
            let blob_src = self.root.join(name);
            let blob_dst = peer.join(name);
            tokio::fs::copy(&blob_src, &blob_dst)
                .await
                .map_err(|source| StoreError::Io {
                    path: blob_dst,
                    source,
                })?;
            let meta_src = self.metadata_path(name);
            let meta_dst = peer_meta.join(format!("{name}.json"));
            tokio::fs::copy(&meta_src, &meta_dst)
                .await
                .map_err(|source| StoreError::Io {
                    path: meta_dst,
                    source,
                })?;
            tracing::debug!(%name, peer = %peer.display(), "broadcast object to peer");
        }
        Ok(())
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{name}.json"))
    }

    fn read_metadata(&self, name: &str) -> Result<Option<ObjectMetadata>, StoreError> {
        let path = self.metadata_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path,
            source,
        })?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Metadata {
                name: name.to_string(),
                source,
            })
    }

    fn write_metadata(&self, name: &str, meta: &ObjectMetadata) -> Result<(), StoreError> {
        let path = self.metadata_path(name);
        let body = serde_json::to_string(meta).expect("metadata always serializes");
        std::fs::write(&path, body).map_err(|source| StoreError::Io { path, source })
    }
}

/// Advisory per-name lock held for the duration of a put.
///
/// Acquire is an atomic directory creation; the guard removes the
/// directory on drop, including on error paths.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(root: &Path, name: &str) -> Result<Self, StoreError> {
        let path = root.join(format!("{name}{LOCK_SUFFIX}"));
        match std::fs::create_dir(&path) {
            Ok(()) => Ok(Self { path }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::Locked {
                    name: name.to_string(),
                })
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release store lock");
        }
    }
}

fn check_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.contains('/') || name == META_DIR {
        return Err(StoreError::BadName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn compile_pattern(pattern: Option<&str>) -> Result<Option<glob::Pattern>, StoreError> {
    match pattern {
        None => Ok(None),
        Some(raw) => glob::Pattern::new(raw)
            .map(Some)
            .map_err(|source| StoreError::Pattern {
                pattern: raw.to_string(),
                source,
            }),
    }
}

fn file_mtime_ms(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as i64)
}

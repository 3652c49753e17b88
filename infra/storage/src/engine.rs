//! The [`Storage`] handle: path resolution, atomic file I/O and directory accounting.

use crate::builder::StorageBuilder;
use crate::error::{StorageError, StorageErrorExt};
use crate::maintenance;
use crate::security;
use std::fs;
use std::io::{ErrorKind, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Infix of temporary files produced by [`Storage::write`]. Such files never count as usage.
pub const TMP_MARKER: &str = ".qhubtmp.";

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

impl Compression {
    #[must_use]
    fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None => data.to_vec(),
            Self::Lz4 => lz4_flex::compress_prepend_size(data),
        }
    }

    fn decompress(self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => {
                lz4_flex::decompress_size_prepended(data).context("Lz4 decompression failed")
            },
        }
    }
}

#[derive(Debug)]
pub struct StorageInner {
    /// Canonical physical root of the sandbox.
    pub(crate) root: PathBuf,
    pub(crate) compression: Compression,
    pub(crate) tmp_counter: AtomicU64,
}

/// A cheap, cloneable handle to a sandboxed directory tree.
///
/// Every method blocks. Paths are relative to the root; absolute paths and `..` sequences that
/// would leave the root are rejected with [`StorageError::PathTraversalAttempt`].
#[derive(Debug, Clone)]
pub struct Storage {
    pub(crate) inner: Arc<StorageInner>,
}

impl Deref for Storage {
    type Target = StorageInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Storage {
    #[must_use = "The sandbox is not opened until you call .open()"]
    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Resolves a relative path to a physical path inside the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PathTraversalAttempt`] if the path tries to escape the sandbox.
    /// Returns [`StorageError::Io`] if the path or its parent cannot be verified on the filesystem.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, StorageError> {
        security::resolve_path(&self.root, path)
    }

    /// Checks whether anything exists at `path`.
    ///
    /// # Errors
    ///
    /// Fails only when path resolution fails.
    pub fn exists(&self, path: impl AsRef<Path>) -> Result<bool, StorageError> {
        Ok(self.resolve(path)?.exists())
    }

    /// Checks whether `path` is an existing directory.
    ///
    /// # Errors
    ///
    /// Fails only when path resolution fails.
    pub fn is_dir(&self, path: impl AsRef<Path>) -> Result<bool, StorageError> {
        Ok(self.resolve(path)?.is_dir())
    }

    /// Creates `path` and any missing parents. Returns `true` when the leaf did not exist before.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn create_dir(&self, path: impl AsRef<Path>) -> Result<bool, StorageError> {
        let resolved = self.resolve(path)?;
        if resolved.is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(&resolved)
            .context(format!("Failed to create directory: {}", resolved.display()))?;
        debug!(path = %resolved.display(), "Directory created");
        Ok(true)
    }

    /// Removes `path` and everything below it. Returns `false` when nothing was there.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on any failure other than the path being absent.
    pub fn remove_dir_all(&self, path: impl AsRef<Path>) -> Result<bool, StorageError> {
        let resolved = self.resolve(path)?;
        if resolved == self.root {
            return Err(StorageError::PathTraversalAttempt {
                message: resolved.display().to_string().into(),
                context: Some("Refusing to remove the sandbox root".into()),
            });
        }
        match fs::remove_dir_all(&resolved) {
            Ok(()) => {
                debug!(path = %resolved.display(), "Directory removed");
                Ok(true)
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io {
                source: Arc::new(err),
                context: Some(format!("Failed to remove: {}", resolved.display()).into()),
            }),
        }
    }

    /// Lists the names of the direct child directories of `path`, sorted.
    ///
    /// A missing `path` yields an empty list. Names that are not valid UTF-8 are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be read.
    pub fn list_dirs(&self, path: impl AsRef<Path>) -> Result<Vec<String>, StorageError> {
        let resolved = self.resolve(path)?;
        let entries = match fs::read_dir(&resolved) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StorageError::Io {
                    source: Arc::new(err),
                    context: Some(format!("Failed to list: {}", resolved.display()).into()),
                });
            },
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.context("Failed to read directory entry")?;
            if !entry.file_type().context("Failed to read entry type")?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => warn!(name = ?raw, "Skipping non UTF-8 directory name"),
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    /// Sums the on-disk length of every regular file below `path`, temporary files excluded.
    ///
    /// A missing `path` has size 0.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Walk`] if the tree cannot be traversed.
    pub fn dir_size(&self, path: impl AsRef<Path>) -> Result<u64, StorageError> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Ok(0);
        }

        let mut total = 0_u64;
        for entry in WalkDir::new(&resolved) {
            let entry = match entry {
                Ok(entry) => entry,
                // Entries can vanish while walking a directory that is being cleared.
                Err(err) if err.io_error().is_some_and(|e| e.kind() == ErrorKind::NotFound) => {
                    continue;
                },
                Err(err) => {
                    return Err(err).context(format!("Failed to walk: {}", resolved.display()));
                },
            };
            if !entry.file_type().is_file() || maintenance::is_tmp_name(entry.file_name()) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => total = total.saturating_add(meta.len()),
                Err(err) if err.io_error().is_some_and(|e| e.kind() == ErrorKind::NotFound) => {},
                Err(err) => return Err(err).context("Failed to stat file"),
            }
        }
        Ok(total)
    }

    /// Reads a whole file, decompressing it if the handle uses compression.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] if the path does not exist.
    /// Returns [`StorageError::Decompress`] if the payload is corrupted.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, StorageError> {
        let resolved = self.resolve(path)?;

        let data = match fs::read(&resolved) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound {
                    message: resolved.display().to_string().into(),
                    context: None,
                });
            },
            Err(err) => {
                return Err(StorageError::Io {
                    source: Arc::new(err),
                    context: Some(format!("Read failed: {}", resolved.display()).into()),
                });
            },
        };

        self.inner.compression.decompress(&data)
    }

    /// Writes a file atomically.
    ///
    /// The payload goes to a unique `<name>.qhubtmp.<n>` sibling, is synced, then renamed over
    /// the target; the parent directory is synced afterwards. Missing parents are created. On
    /// platforms without atomic replace the target is removed first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PathTraversalAttempt`] if the path escapes the sandbox.
    /// Returns [`StorageError::Io`] if the disk is full or hardware failure occurs.
    pub fn write(&self, path: impl AsRef<Path>, data: &[u8]) -> Result<(), StorageError> {
        let resolved = self.resolve(path)?;

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create parents of {}", resolved.display()))?;
        }

        let temp = unique_tmp_path(&resolved, &self.tmp_counter);
        let final_data = self.inner.compression.compress(data);

        {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp)
                .context(format!("Temp creation failed: {}", temp.display()))?;
            file.write_all(&final_data).context("Write failed")?;
            file.sync_all().context("Hardware sync failed")?;
        }

        if let Err(err) = fs::rename(&temp, &resolved) {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&resolved)
                    .context(format!("Failed to replace existing file: {}", resolved.display()))?;
                fs::rename(&temp, &resolved).context(format!(
                    "Atomic swap failed: {} -> {}",
                    temp.display(),
                    resolved.display()
                ))?;
            } else {
                let _ = fs::remove_file(&temp);
                return Err(StorageError::Io {
                    source: Arc::new(err),
                    context: Some(
                        format!("Atomic swap failed: {} -> {}", temp.display(), resolved.display())
                            .into(),
                    ),
                });
            }
        }

        if let Some(parent) = resolved.parent() {
            sync_dir(parent);
        }

        debug!(path = %resolved.display(), "File saved atomically");
        Ok(())
    }

    /// Deletes a single file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::FileNotFound`] if the file does not exist and
    /// [`StorageError::Io`] on permission or hardware failures.
    pub fn delete(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let resolved = self.resolve(path)?;
        match fs::remove_file(&resolved) {
            Ok(()) => {},
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound {
                    message: resolved.display().to_string().into(),
                    context: None,
                });
            },
            Err(err) => {
                return Err(StorageError::Io {
                    source: Arc::new(err),
                    context: Some(format!("Failed to delete: {}", resolved.display()).into()),
                });
            },
        }
        debug!(path = %resolved.display(), "File deleted");
        Ok(())
    }

    /// Removes stale temporary files under the root. Returns how many were removed.
    pub fn purge_tmp(&self) -> usize {
        maintenance::purge_tmp(&self.root)
    }
}

fn sync_dir(path: &Path) {
    match fs::File::open(path) {
        Ok(dir) => {
            if let Err(err) = dir.sync_all() {
                warn!(path = %path.display(), error = %err, "Directory sync failed");
            }
        },
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Directory open failed");
        },
    }
}

fn unique_tmp_path(target: &Path, counter: &AtomicU64) -> PathBuf {
    let counter = counter.fetch_add(1, Ordering::Relaxed);
    let file_name = target.file_name().and_then(|s| s.to_str()).unwrap_or("storage");
    target.with_file_name(format!("{file_name}{TMP_MARKER}{counter}"))
}

use crate::error::{QuotaError, QuotaErrorExt};
use crate::layout::METADATA_FILE;
use qhub_domain::OriginKey;
use qhub_storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;
use tracing::warn;

/// Per-origin bookkeeping stored next to the engine directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    pub key: OriginKey,
    pub persisted: bool,
    /// Microseconds since the Unix epoch.
    pub last_access: i64,
}

/// Blocking directory primitives. Paths are relative to the storage root.
///
/// Only ever called from the worker pool.
pub trait Filesystem: Send + Sync + Debug {
    /// # Errors
    /// Fails on I/O errors or paths escaping the root.
    fn exists(&self, path: &Path) -> Result<bool, QuotaError>;

    /// Returns `true` when the directory was created by this call.
    ///
    /// # Errors
    /// Fails on I/O errors or paths escaping the root.
    fn create_directory(&self, path: &Path) -> Result<bool, QuotaError>;

    /// Returns `false` when there was nothing to delete.
    ///
    /// # Errors
    /// Fails on I/O errors or paths escaping the root.
    fn delete_recursive(&self, path: &Path) -> Result<bool, QuotaError>;

    /// Reads the metadata of an origin directory. Missing or unreadable metadata yields `None`.
    ///
    /// # Errors
    /// Fails on I/O errors other than a missing file.
    fn read_metadata(&self, dir: &Path) -> Result<Option<OriginMetadata>, QuotaError>;

    /// # Errors
    /// Fails on I/O errors or paths escaping the root.
    fn write_metadata(&self, dir: &Path, metadata: &OriginMetadata) -> Result<(), QuotaError>;

    /// Names of the subdirectories of `path`, sorted. A missing directory lists as empty.
    ///
    /// # Errors
    /// Fails on I/O errors or paths escaping the root.
    fn list_directories(&self, path: &Path) -> Result<Vec<String>, QuotaError>;

    /// Bytes of the regular files below `path`.
    ///
    /// # Errors
    /// Fails on I/O errors or paths escaping the root.
    fn directory_size(&self, path: &Path) -> Result<u64, QuotaError>;
}

impl Filesystem for Storage {
    fn exists(&self, path: &Path) -> Result<bool, QuotaError> {
        Ok(Self::exists(self, path)?)
    }

    fn create_directory(&self, path: &Path) -> Result<bool, QuotaError> {
        self.create_dir(path).context("Creating directory")
    }

    fn delete_recursive(&self, path: &Path) -> Result<bool, QuotaError> {
        self.remove_dir_all(path).context("Deleting directory")
    }

    fn read_metadata(&self, dir: &Path) -> Result<Option<OriginMetadata>, QuotaError> {
        let bytes = match self.read(dir.join(METADATA_FILE)) {
            Ok(bytes) => bytes,
            Err(StorageError::FileNotFound { .. }) => return Ok(None),
            Err(err) => return Err(err).context("Reading origin metadata"),
        };
        match postcard::from_bytes(&bytes) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "Ignoring corrupt origin metadata");
                Ok(None)
            },
        }
    }

    fn write_metadata(&self, dir: &Path, metadata: &OriginMetadata) -> Result<(), QuotaError> {
        let bytes = postcard::to_allocvec(metadata).context("Encoding origin metadata")?;
        self.write(dir.join(METADATA_FILE), &bytes).context("Writing origin metadata")
    }

    fn list_directories(&self, path: &Path) -> Result<Vec<String>, QuotaError> {
        self.list_dirs(path).context("Listing directories")
    }

    fn directory_size(&self, path: &Path) -> Result<u64, QuotaError> {
        self.dir_size(path).context("Measuring directory")
    }
}

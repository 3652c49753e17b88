use crate::error::{QuotaError, QuotaErrorExt};
use crate::layout::USAGE_CACHE_FILE;
use crate::usage::CachedOrigin;
use qhub_storage::{Compression, Storage, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::Path;
use tracing::{debug, warn};

/// Persisted usage rows that let startup skip a full directory scan.
///
/// `load` is followed by `invalidate`, so a crash before the next `store` forces a rescan.
pub trait UsageCache: Send + Sync + Debug {
    /// `None` when there is no usable cache.
    ///
    /// # Errors
    /// Fails on I/O errors.
    fn load(&self) -> Result<Option<Vec<CachedOrigin>>, QuotaError>;

    /// # Errors
    /// Fails on I/O errors.
    fn store(&self, rows: &[CachedOrigin]) -> Result<(), QuotaError>;

    /// # Errors
    /// Fails on I/O errors.
    fn invalidate(&self) -> Result<(), QuotaError>;
}

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    rows: Vec<CachedOrigin>,
}

/// A single postcard file below the storage root, written atomically.
#[derive(Debug, Clone)]
pub struct FileUsageCache {
    storage: Storage,
}

impl FileUsageCache {
    /// # Errors
    /// Fails if `root` cannot be opened.
    pub fn open(root: &Path, compress: bool) -> Result<Self, QuotaError> {
        let compression = if compress { Compression::Lz4 } else { Compression::None };
        let storage = Storage::builder()
            .root(root)
            .compression(compression)
            .open()
            .context("Opening usage cache")?;
        Ok(Self { storage })
    }
}

impl UsageCache for FileUsageCache {
    fn load(&self) -> Result<Option<Vec<CachedOrigin>>, QuotaError> {
        let bytes = match self.storage.read(USAGE_CACHE_FILE) {
            Ok(bytes) => bytes,
            Err(StorageError::FileNotFound { .. }) => return Ok(None),
            Err(err @ StorageError::Decompress { .. }) => {
                warn!(error = %err, "Discarding undecodable usage cache");
                return Ok(None);
            },
            Err(err) => return Err(err).context("Loading usage cache"),
        };
        match postcard::from_bytes::<CacheFile>(&bytes) {
            Ok(file) if file.version == CACHE_VERSION => {
                debug!(rows = file.rows.len(), "Usage cache loaded");
                Ok(Some(file.rows))
            },
            Ok(file) => {
                warn!(version = file.version, "Discarding usage cache of another version");
                Ok(None)
            },
            Err(err) => {
                warn!(error = %err, "Discarding corrupt usage cache");
                Ok(None)
            },
        }
    }

    fn store(&self, rows: &[CachedOrigin]) -> Result<(), QuotaError> {
        let file = CacheFile { version: CACHE_VERSION, rows: rows.to_vec() };
        let bytes = postcard::to_allocvec(&file).context("Encoding usage cache")?;
        self.storage.write(USAGE_CACHE_FILE, &bytes).context("Storing usage cache")?;
        debug!(rows = rows.len(), "Usage cache stored");
        Ok(())
    }

    fn invalidate(&self) -> Result<(), QuotaError> {
        match self.storage.delete(USAGE_CACHE_FILE) {
            Ok(()) | Err(StorageError::FileNotFound { .. }) => Ok(()),
            Err(err) => Err(err).context("Invalidating usage cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qhub_domain::PersistenceKind;
    use tempfile::TempDir;

    fn row(origin: &str, usage: u64) -> CachedOrigin {
        CachedOrigin {
            persistence: PersistenceKind::Default,
            suffix: String::new(),
            group: "a.com".to_owned(),
            origin: origin.to_owned(),
            persisted: false,
            usage,
            access_time: 7,
        }
    }

    #[test]
    fn stored_rows_load_until_invalidated() {
        let dir = TempDir::new().expect("tempdir");
        let cache = FileUsageCache::open(dir.path(), true).expect("cache");
        assert_eq!(cache.load().expect("load"), None);

        let rows = vec![row("https://a.com", 10), row("https://b.a.com", 20)];
        cache.store(&rows).expect("store");
        assert_eq!(cache.load().expect("load"), Some(rows));

        cache.invalidate().expect("invalidate");
        cache.invalidate().expect("invalidate twice");
        assert_eq!(cache.load().expect("load"), None);
    }

    #[test]
    fn compression_mismatch_reads_as_missing() {
        let dir = TempDir::new().expect("tempdir");
        FileUsageCache::open(dir.path(), false)
            .expect("cache")
            .store(&[row("https://a.com", 1)])
            .expect("store");
        let compressed = FileUsageCache::open(dir.path(), true).expect("cache");
        assert_eq!(compressed.load().expect("load"), None);
    }
}

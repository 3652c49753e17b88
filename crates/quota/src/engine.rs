use crate::error::QuotaError;
use crate::fs::Filesystem;
use crate::layout;
use crate::lock::LockId;
use parking_lot::Mutex;
use qhub_domain::{ClientKey, EngineKind, OriginKey};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info};

/// A storage engine sharing the per-origin directories.
///
/// Directory methods are blocking and run on the worker pool; the hooks run on the coordinator
/// and must not block.
pub trait StorageEngine: Send + Sync + Debug {
    fn kind(&self) -> EngineKind;

    /// Prepares the engine's part of an origin and returns the bytes it currently uses.
    ///
    /// # Errors
    /// Fails on I/O errors.
    fn init_origin(&self, fs: &dyn Filesystem, origin: &OriginKey) -> Result<u64, QuotaError>;

    /// Bytes used by the engine for `origin`.
    ///
    /// # Errors
    /// Fails on I/O errors.
    fn get_usage(&self, fs: &dyn Filesystem, origin: &OriginKey) -> Result<u64, QuotaError>;

    /// Deletes the engine's data for `origin`. Returns the bytes freed.
    ///
    /// # Errors
    /// Fails on I/O errors.
    fn delete_origin(&self, fs: &dyn Filesystem, origin: &OriginKey) -> Result<u64, QuotaError>;

    /// Asks in-flight work holding the given locks to stop.
    fn abort_operations(&self, locks: &[LockId]);

    fn release_worker_resources(&self);

    fn start_idle_maintenance(&self);

    fn stop_idle_maintenance(&self);
}

/// Engine keeping each origin's data in its own `<origin>/<engine>` directory.
#[derive(Debug)]
pub struct DirectoryEngine {
    kind: EngineKind,
    aborted: Mutex<Vec<LockId>>,
    maintenance: AtomicBool,
    releases: AtomicUsize,
}

impl DirectoryEngine {
    #[must_use]
    pub const fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            aborted: Mutex::new(Vec::new()),
            maintenance: AtomicBool::new(false),
            releases: AtomicUsize::new(0),
        }
    }

    /// Lock ids passed to [`StorageEngine::abort_operations`] so far.
    #[must_use]
    pub fn aborted(&self) -> Vec<LockId> {
        self.aborted.lock().clone()
    }

    #[must_use]
    pub fn is_maintaining(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::Acquire)
    }

    fn dir(&self, origin: &OriginKey) -> std::path::PathBuf {
        layout::client_dir(&ClientKey { origin: origin.clone(), engine: self.kind })
    }
}

impl StorageEngine for DirectoryEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn init_origin(&self, fs: &dyn Filesystem, origin: &OriginKey) -> Result<u64, QuotaError> {
        let dir = self.dir(origin);
        if !fs.exists(&dir)? {
            return Ok(0);
        }
        fs.directory_size(&dir)
    }

    fn get_usage(&self, fs: &dyn Filesystem, origin: &OriginKey) -> Result<u64, QuotaError> {
        fs.directory_size(&self.dir(origin))
    }

    fn delete_origin(&self, fs: &dyn Filesystem, origin: &OriginKey) -> Result<u64, QuotaError> {
        let dir = self.dir(origin);
        let bytes = fs.directory_size(&dir)?;
        if fs.delete_recursive(&dir)? {
            debug!(engine = %self.kind, origin = %origin, bytes, "Engine data deleted");
        }
        Ok(bytes)
    }

    fn abort_operations(&self, locks: &[LockId]) {
        if !locks.is_empty() {
            info!(engine = %self.kind, count = locks.len(), "Aborting operations");
            self.aborted.lock().extend_from_slice(locks);
        }
    }

    fn release_worker_resources(&self) {
        self.releases.fetch_add(1, Ordering::AcqRel);
    }

    fn start_idle_maintenance(&self) {
        self.maintenance.store(true, Ordering::Release);
    }

    fn stop_idle_maintenance(&self) {
        self.maintenance.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qhub_domain::{PersistenceKind, PrincipalKey};
    use qhub_storage::Storage;
    use tempfile::TempDir;

    #[test]
    fn measures_and_deletes_its_own_directory() {
        let dir = TempDir::new().expect("tempdir");
        let fs = Storage::builder().root(dir.path()).open().expect("storage");
        let origin = PrincipalKey::new("https://a.com", "a.com", "").with_persistence(PersistenceKind::Default);
        let engine = DirectoryEngine::new(EngineKind::Cache);

        assert_eq!(engine.init_origin(&fs, &origin).expect("init"), 0);
        fs.write("default/https+++a.com/cache/entry", &[1; 64]).expect("write");
        fs.write("default/https+++a.com/blob/other", &[1; 16]).expect("write");
        assert_eq!(engine.get_usage(&fs, &origin).expect("usage"), 64);

        assert_eq!(engine.delete_origin(&fs, &origin).expect("delete"), 64);
        assert_eq!(engine.get_usage(&fs, &origin).expect("usage"), 0);
        assert!(fs.exists("default/https+++a.com/blob/other").expect("exists"));
    }

    #[test]
    fn hooks_are_recorded() {
        let engine = DirectoryEngine::new(EngineKind::Blob);
        engine.abort_operations(&[3, 4]);
        engine.start_idle_maintenance();
        assert!(engine.is_maintaining());
        engine.stop_idle_maintenance();
        engine.release_worker_resources();
        assert_eq!(engine.aborted(), vec![3, 4]);
        assert!(!engine.is_maintaining());
        assert_eq!(engine.release_count(), 1);
    }
}

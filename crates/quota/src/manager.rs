use crate::builder::{NoRoot, QuotaManagerBuilder};
use crate::cache::UsageCache;
use crate::engine::StorageEngine;
use crate::error::QuotaError;
use crate::fs::Filesystem;
use crate::init::{self, InitMarkers, with_markers};
use crate::layout;
use crate::lock::{DirectoryLock, LockScope, OriginPattern, OriginScope, PendingLock};
use crate::pipeline::{
    self, ClearOp, ClearTarget, EstimateOp, GetOriginUsageOp, GetUsageOp, OperationCallbacks, PersistOp,
    PersistedOp, ShutdownStorageOp, WorkContext,
};
use crate::state::SharedState;
use crate::usage::{Estimate, OriginUsage, Overage, UsageSnapshot, eviction, now};
use qhub_domain::{ClientKey, EngineKind, OriginKey, PersistenceKind, PrincipalKey};
use qhub_runtime::{CoordinatorToken, Executors, ThreadBound};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug)]
pub(crate) struct ManagerInner {
    pub(crate) executors: Executors,
    pub(crate) state: Arc<SharedState>,
    pub(crate) fs: Arc<dyn Filesystem>,
    pub(crate) root: PathBuf,
    pub(crate) engines: Vec<Arc<dyn StorageEngine>>,
    pub(crate) cache: Option<Arc<dyn UsageCache>>,
    pub(crate) markers: ThreadBound<InitMarkers>,
    /// Whether the engines run idle maintenance.
    pub(crate) maintenance: ThreadBound<bool>,
    pub(crate) evicting: AtomicBool,
}

fn join_failed(err: &JoinError) -> QuotaError {
    if err.is_cancelled() {
        QuotaError::abort("executor stopped before the task finished")
    } else {
        QuotaError::internal(format!("task panicked: {err}"))
    }
}

impl ManagerInner {
    /// Creates and acquires a lock.
    pub(crate) async fn lock(&self, scope: LockScope, exclusive: bool) -> Result<DirectoryLock, QuotaError> {
        PendingLock::create(&self.state, scope, exclusive)?.open().await
    }

    /// Runs `f` on the worker pool.
    pub(crate) async fn blocking<R, F>(&self, f: F) -> Result<R, QuotaError>
    where
        R: Send + 'static,
        F: FnOnce(&dyn Filesystem) -> Result<R, QuotaError> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        self.executors.spawn_io(move || f(fs.as_ref())).await.map_err(|e| join_failed(&e))?
    }

    pub(crate) fn engine(&self, kind: EngineKind) -> Result<Arc<dyn StorageEngine>, QuotaError> {
        self.engines
            .iter()
            .find(|engine| engine.kind() == kind)
            .cloned()
            .ok_or_else(|| QuotaError::invalid(format!("engine '{kind}' is not configured")))
    }

    pub(crate) fn work_context(&self) -> WorkContext {
        WorkContext {
            fs: Arc::clone(&self.fs),
            engines: self.engines.clone(),
            cache: self.cache.clone(),
            state: Arc::clone(&self.state),
        }
    }

    fn set_maintenance(&self, running: bool) -> Result<(), QuotaError> {
        let changed = toggle_maintenance(&self.maintenance, running)?;
        if changed {
            for engine in &self.engines {
                if running {
                    engine.start_idle_maintenance();
                } else {
                    engine.stop_idle_maintenance();
                }
            }
            debug!(running, "Idle maintenance toggled");
        }
        Ok(())
    }
}

/// Sets the flag and returns whether it changed.
fn toggle_maintenance(flag: &ThreadBound<bool>, running: bool) -> Result<bool, QuotaError> {
    let Some(token) = CoordinatorToken::current() else {
        return Err(QuotaError::internal("maintenance flag touched off the coordinator"));
    };
    Ok(flag.with(&token, |current| std::mem::replace(current, running) != running))
}

/// The coordinating facade.
///
/// Cloning is cheap. Every async method hops onto the coordinator and resolves from there;
/// after [`QuotaManager::shutdown`] started they fail with [`QuotaError::Abort`].
#[derive(Debug, Clone)]
pub struct QuotaManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl QuotaManager {
    #[must_use]
    pub fn builder() -> QuotaManagerBuilder<NoRoot> {
        QuotaManagerBuilder::new()
    }

    /// Root directory of the managed storage.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Absolute path of a client directory.
    #[must_use]
    pub fn client_path(&self, client: &ClientKey) -> PathBuf {
        self.inner.root.join(layout::client_dir(client))
    }

    async fn coordinate<R, F, Fut>(&self, f: F) -> Result<R, QuotaError>
    where
        R: Send + 'static,
        F: FnOnce(Arc<ManagerInner>) -> Fut,
        Fut: Future<Output = Result<R, QuotaError>> + Send + 'static,
    {
        self.inner.state.ensure_running()?;
        let task = f(Arc::clone(&self.inner));
        self.inner.executors.coordinate(task).await.map_err(|e| join_failed(&e))?
    }

    /// Initializes everything a client needs and returns a shared lock on its directory.
    ///
    /// Without `create_if_missing` a missing origin directory is not created; the lock is still
    /// granted.
    ///
    /// # Errors
    /// Fails on I/O errors, unknown engines and shutdown.
    pub async fn open_client_directory(
        &self,
        client: ClientKey,
        create_if_missing: bool,
    ) -> Result<DirectoryLock, QuotaError> {
        self.coordinate(move |inner| async move {
            loop {
                let exists = init::initialize_origin(&inner, &client.origin, create_if_missing).await?;
                if exists {
                    init::initialize_client(&inner, &client).await?;
                }

                let lock = inner.lock(LockScope::client(&client), false).await?;
                let valid = with_markers(&inner.markers, |m| {
                    if exists { m.clients.is_initialized(&client) } else { m.origins.get(&client.origin) != Some(true) }
                })?;
                if valid {
                    inner.state.with(|core| core.usage.touch(&client.origin, now()));
                    return Ok(lock);
                }
                debug!(client = %client, "Client was reset while waiting for its lock, retrying");
            }
        })
        .await
    }

    /// Acquires an arbitrary directory lock once the storage root exists.
    ///
    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn open_storage_directory(
        &self,
        persistence: Option<PersistenceKind>,
        origin: OriginScope,
        engine: Option<EngineKind>,
        exclusive: bool,
    ) -> Result<DirectoryLock, QuotaError> {
        self.coordinate(move |inner| async move {
            init::initialize_storage(&inner).await?;
            inner.lock(LockScope { persistence, origin, engine }, exclusive).await
        })
        .await
    }

    /// Registers a lock without waiting for it. The caller drives
    /// [`PendingLock::prepare`], [`PendingLock::invalidate_blockers`] and
    /// [`PendingLock::acquire`] itself.
    ///
    /// # Errors
    /// Fails during shutdown.
    pub fn create_lock(&self, scope: LockScope, exclusive: bool) -> Result<PendingLock, QuotaError> {
        PendingLock::create(&self.inner.state, scope, exclusive)
    }

    /// Returns whether this call created the repositories.
    ///
    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn initialize_storage(&self) -> Result<bool, QuotaError> {
        self.coordinate(|inner| async move { init::initialize_storage(&inner).await }).await
    }

    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn initialize_persistent_storage(&self) -> Result<bool, QuotaError> {
        self.coordinate(|inner| async move { init::initialize_persistent_storage(&inner).await }).await
    }

    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn initialize_temporary_storage(&self) -> Result<bool, QuotaError> {
        self.coordinate(|inner| async move { init::initialize_temporary_storage(&inner).await }).await
    }

    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn initialize_group(&self, principal: PrincipalKey) -> Result<bool, QuotaError> {
        self.coordinate(move |inner| async move { init::initialize_group(&inner, &principal).await })
            .await
    }

    /// Returns whether the origin directory exists afterwards.
    ///
    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn initialize_origin(&self, origin: OriginKey, create: bool) -> Result<bool, QuotaError> {
        self.coordinate(move |inner| async move { init::initialize_origin(&inner, &origin, create).await })
            .await
    }

    /// # Errors
    /// Fails on I/O errors, unknown engines and shutdown.
    pub async fn initialize_client(&self, client: ClientKey) -> Result<bool, QuotaError> {
        self.coordinate(move |inner| async move { init::initialize_client(&inner, &client).await }).await
    }

    /// Measures every known origin. Internal origins are left out unless `all_origins` is set.
    ///
    /// # Errors
    /// [`QuotaError::Cancelled`] carries what was measured before `cancel` fired.
    pub async fn get_usage(
        &self,
        all_origins: bool,
        cancel: CancellationToken,
    ) -> Result<Vec<OriginUsage>, QuotaError> {
        self.run(GetUsageOp::new(all_origins, cancel)).await
    }

    /// # Errors
    /// [`QuotaError::Cancelled`] carries what was measured before `cancel` fired.
    pub async fn get_origin_usage(
        &self,
        principal: PrincipalKey,
        cancel: CancellationToken,
    ) -> Result<UsageSnapshot, QuotaError> {
        self.run(GetOriginUsageOp::new(principal, cancel)).await
    }

    /// Clears one origin under one or every persistence kind. Returns whether anything was removed.
    ///
    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn clear_storage_for_origin(
        &self,
        principal: PrincipalKey,
        persistence: Option<PersistenceKind>,
    ) -> Result<bool, QuotaError> {
        self.clear(ClearTarget::Origin { principal, persistence }).await
    }

    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn clear_storage_for_engine(
        &self,
        principal: PrincipalKey,
        persistence: Option<PersistenceKind>,
        engine: EngineKind,
    ) -> Result<bool, QuotaError> {
        self.clear(ClearTarget::Engine { principal, persistence, engine }).await
    }

    /// # Errors
    /// Returns [`QuotaError::InvalidArgument`] for an empty prefix.
    pub async fn clear_storage_for_origin_prefix(&self, prefix: impl Into<String>) -> Result<bool, QuotaError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(QuotaError::invalid("origin prefix is empty"));
        }
        self.clear(ClearTarget::Prefix(prefix)).await
    }

    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn clear_storage_for_pattern(&self, pattern: OriginPattern) -> Result<bool, QuotaError> {
        self.clear(ClearTarget::Pattern(pattern)).await
    }

    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn clear_private_repository(&self) -> Result<bool, QuotaError> {
        self.clear(ClearTarget::Private).await
    }

    /// Removes every repository and forgets all usage.
    ///
    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn clear_storage(&self) -> Result<bool, QuotaError> {
        self.clear(ClearTarget::All).await
    }

    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn clear(&self, target: ClearTarget) -> Result<bool, QuotaError> {
        self.run(ClearOp::new(target)).await
    }

    /// Marks the default-repository origin of `principal` persisted. Returns whether it changed.
    ///
    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn persist(&self, principal: PrincipalKey) -> Result<bool, QuotaError> {
        self.run(PersistOp::new(&principal)).await
    }

    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn persisted(&self, principal: PrincipalKey) -> Result<bool, QuotaError> {
        self.run(PersistedOp::new(&principal)).await
    }

    /// Group usage of `principal` and the ceiling that applies to it.
    ///
    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn estimate(&self, principal: PrincipalKey) -> Result<Estimate, QuotaError> {
        self.run(EstimateOp::new(principal)).await
    }

    async fn run<Op: pipeline::StorageOperation>(&self, op: Op) -> Result<Op::Output, QuotaError> {
        self.coordinate(move |inner| async move {
            pipeline::execute(&inner, op, OperationCallbacks::none()).await
        })
        .await
    }

    /// Applies a usage delta reported by an engine. Callable from any thread.
    ///
    /// An increase that pushes temporary storage over a ceiling schedules an eviction pass.
    pub fn update_usage(&self, client: &ClientKey, delta: i64) {
        let overage = self.inner.state.with(|core| core.usage.adjust_usage(client, delta, now()));
        if let Some(overage) = overage
            && !self.inner.state.is_shutting_down()
        {
            debug!(?overage, "Usage over limit, scheduling eviction");
            let inner = Arc::clone(&self.inner);
            drop(self.inner.executors.coordinate(async move {
                if let Err(err) = eviction::enforce_limits(&inner).await {
                    error!(error = %err, "Eviction pass failed");
                }
            }));
        }
    }

    /// A handle an engine keeps to report usage of one client.
    #[must_use]
    pub fn usage_reporter(&self, client: ClientKey) -> UsageReporter {
        UsageReporter { manager: self.clone(), client }
    }

    /// Usage of `principal` as currently accounted, without touching the disk.
    #[must_use]
    pub fn cached_origin_usage(&self, principal: &PrincipalKey) -> UsageSnapshot {
        self.inner.state.with(|core| core.usage.usage_for(principal))
    }

    /// Bytes of temporary storage currently accounted.
    #[must_use]
    pub fn temporary_usage(&self) -> u64 {
        self.inner.state.with(|core| core.usage.temporary_usage())
    }

    /// Evicts at least `min_bytes` of temporary storage if candidates allow. Returns the bytes freed.
    ///
    /// # Errors
    /// Fails on I/O errors and shutdown.
    pub async fn evict(&self, min_bytes: u64) -> Result<u64, QuotaError> {
        self.coordinate(move |inner| async move {
            init::initialize_temporary_storage(&inner).await?;
            eviction::evict(&inner, &Overage::Global { excess: min_bytes }).await
        })
        .await
    }

    /// # Errors
    /// Fails during shutdown.
    pub async fn start_idle_maintenance(&self) -> Result<(), QuotaError> {
        self.coordinate(|inner| async move { inner.set_maintenance(true) }).await
    }

    /// # Errors
    /// Fails during shutdown.
    pub async fn stop_idle_maintenance(&self) -> Result<(), QuotaError> {
        self.coordinate(|inner| async move { inner.set_maintenance(false) }).await
    }

    /// Shuts storage down: rejects queued locks, asks engines to abort work under acquired locks,
    /// waits for those locks to drop, writes the usage cache and releases engine resources.
    ///
    /// Returns `false` if shutdown had already started.
    ///
    /// # Errors
    /// Fails on I/O errors while writing the usage cache.
    pub async fn shutdown_storage(&self, callbacks: OperationCallbacks) -> Result<bool, QuotaError> {
        let inner = Arc::clone(&self.inner);
        let task = async move {
            if inner.state.is_shutting_down() {
                return Ok(false);
            }
            let acquired = inner.state.begin_shutdown();
            info!(locks = acquired.values().map(Vec::len).sum::<usize>(), "Shutting down storage");
            for engine in &inner.engines {
                let ids = acquired.get(&engine.kind()).map_or(&[][..], Vec::as_slice);
                engine.abort_operations(ids);
            }
            inner.set_maintenance(false)?;
            pipeline::execute(&inner, ShutdownStorageOp::default(), callbacks).await
        };
        self.inner.executors.coordinate(task).await.map_err(|e| join_failed(&e))?
    }

    /// # Errors
    /// Same as [`QuotaManager::shutdown_storage`].
    pub async fn shutdown(&self) -> Result<bool, QuotaError> {
        self.shutdown_storage(OperationCallbacks::none()).await
    }
}

/// Reports usage deltas of one client.
#[derive(Debug, Clone)]
pub struct UsageReporter {
    manager: QuotaManager,
    client: ClientKey,
}

impl UsageReporter {
    pub fn report(&self, delta: i64) {
        self.manager.update_usage(&self.client, delta);
    }

    #[must_use]
    pub const fn client(&self) -> &ClientKey {
        &self.client
    }
}

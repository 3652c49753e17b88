use crate::error::QuotaError;
use crate::lock::registry::LockId;
use crate::lock::scope::LockScope;
use crate::state::SharedState;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tracing::trace;

/// The earlier conflicting locks a prepared lock waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockerSnapshot {
    owner: LockId,
    ids: Vec<LockId>,
}

impl BlockerSnapshot {
    #[must_use]
    pub fn blockers(&self) -> &[LockId] {
        &self.ids
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A lock that was created but not acquired yet.
///
/// Dropping it before [`PendingLock::acquire`] completes removes it from the queue.
#[derive(Debug)]
pub struct PendingLock {
    state: Arc<SharedState>,
    scope: LockScope,
    exclusive: bool,
    id: Option<LockId>,
    invalidated: Arc<AtomicBool>,
    bypass_shutdown: bool,
}

impl PendingLock {
    /// Fails with [`QuotaError::Abort`] once shutdown is flagged.
    pub(crate) fn create(
        state: &Arc<SharedState>,
        scope: LockScope,
        exclusive: bool,
    ) -> Result<Self, QuotaError> {
        state.ensure_running()?;
        Ok(Self {
            state: Arc::clone(state),
            scope,
            exclusive,
            id: None,
            invalidated: Arc::new(AtomicBool::new(false)),
            bypass_shutdown: false,
        })
    }

    /// Creation path that ignores the shutdown flag; used by the shutdown operation itself.
    pub(crate) fn create_for_shutdown(state: &Arc<SharedState>, scope: LockScope, exclusive: bool) -> Self {
        Self {
            state: Arc::clone(state),
            scope,
            exclusive,
            id: None,
            invalidated: Arc::new(AtomicBool::new(false)),
            bypass_shutdown: true,
        }
    }

    #[must_use]
    pub const fn scope(&self) -> &LockScope {
        &self.scope
    }

    /// Registers the lock, fixing its place behind every earlier conflicting lock.
    ///
    /// # Errors
    /// Returns [`QuotaError::InvalidArgument`] if the lock was already prepared.
    pub fn prepare(&mut self) -> Result<BlockerSnapshot, QuotaError> {
        if self.id.is_some() {
            return Err(QuotaError::invalid("directory lock prepared twice"));
        }
        let (scope, exclusive, flag) = (self.scope.clone(), self.exclusive, Arc::clone(&self.invalidated));
        let (id, ids) = self.state.with(|core| core.locks.register(scope, exclusive, flag));
        self.id = Some(id);
        Ok(BlockerSnapshot { owner: id, ids })
    }

    /// Invalidates the locks in `snapshot` and the locks queued behind them, except this one.
    pub fn invalidate_blockers(&self, snapshot: &BlockerSnapshot) {
        self.state.with(|core| {
            for id in &snapshot.ids {
                core.locks.invalidate(*id, Some(snapshot.owner));
            }
        });
    }

    /// Resolves once every lock in `snapshot` has dropped.
    ///
    /// # Errors
    /// Returns [`QuotaError::Abort`] when shutdown starts while waiting, and
    /// [`QuotaError::InvalidArgument`] for an unprepared lock or a foreign snapshot.
    pub async fn acquire(mut self, snapshot: BlockerSnapshot) -> Result<DirectoryLock, QuotaError> {
        let Some(id) = self.id.take() else {
            return Err(QuotaError::invalid("directory lock acquired before prepare"));
        };
        let lock = DirectoryLock {
            state: Arc::clone(&self.state),
            id,
            scope: self.scope.clone(),
            exclusive: self.exclusive,
            invalidated: Arc::clone(&self.invalidated),
        };
        if snapshot.owner != id {
            return Err(QuotaError::invalid("blocker snapshot belongs to another lock"));
        }

        let (tx, rx) = oneshot::channel();
        if lock.state.try_acquire(id, tx, self.bypass_shutdown)?.is_some() {
            return Ok(lock);
        }

        trace!(lock = id, blockers = snapshot.ids.len(), "Waiting for directory lock");
        match rx.await {
            Ok(Ok(())) => {
                lock.state.with(|core| core.locks.mark_acquired(id));
                Ok(lock)
            },
            Ok(Err(err)) => Err(err),
            Err(_) => Err(QuotaError::abort("directory lock waiter was discarded")),
        }
    }

    /// Prepares and acquires in one step.
    ///
    /// # Errors
    /// Same as [`PendingLock::acquire`].
    pub async fn open(mut self) -> Result<DirectoryLock, QuotaError> {
        let snapshot = self.prepare()?;
        self.acquire(snapshot).await
    }
}

impl Drop for PendingLock {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            release(&self.state, id);
        }
    }
}

/// An acquired directory lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct DirectoryLock {
    state: Arc<SharedState>,
    id: LockId,
    scope: LockScope,
    exclusive: bool,
    invalidated: Arc<AtomicBool>,
}

impl DirectoryLock {
    /// Wraps a lock registered and acquired inside one critical section.
    pub(crate) const fn acquired(
        state: Arc<SharedState>,
        id: LockId,
        scope: LockScope,
        invalidated: Arc<AtomicBool>,
    ) -> Self {
        Self { state, id, scope, exclusive: true, invalidated }
    }

    #[must_use]
    pub const fn id(&self) -> LockId {
        self.id
    }

    #[must_use]
    pub const fn scope(&self) -> &LockScope {
        &self.scope
    }

    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Set when a clearing operation wants this directory; holders should wind down.
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        release(&self.state, self.id);
    }
}

/// Drops `id`, prunes the origin record it pinned if unused, then wakes the unblocked waiters.
fn release(state: &SharedState, id: LockId) {
    let ready = state.with(|core| {
        let released = core.locks.release(id)?;
        if let Some((persistence, origin)) = released.scope.exact_origin()
            && !core.locks.is_locked(persistence, origin)
        {
            core.usage.prune_if_unused(persistence, origin);
        }
        Some(released.ready)
    });
    for waiter in ready.into_iter().flatten() {
        let _ = waiter.send(Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::Limits;
    use qhub_domain::{EngineKind, PersistenceKind, PrincipalKey};
    use std::time::Duration;

    fn state() -> Arc<SharedState> {
        Arc::new(SharedState::new(Limits { global: 1000, group: 500 }))
    }

    fn client(engine: EngineKind) -> LockScope {
        let key = PrincipalKey::new("https://a.com", "a.com", "").with_persistence(PersistenceKind::Default);
        LockScope::client(&key.client(engine))
    }

    #[tokio::test]
    async fn disjoint_engine_locks_acquire_together() {
        let state = state();
        let a = PendingLock::create(&state, client(EngineKind::Document), false).expect("create");
        let b = PendingLock::create(&state, client(EngineKind::Cache), false).expect("create");
        let a = a.open().await.expect("first");
        let b = b.open().await.expect("second");
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn exclusive_blocks_later_shared_until_drop() {
        let state = state();
        let exclusive = PendingLock::create(&state, client(EngineKind::Cache), true)
            .expect("create")
            .open()
            .await
            .expect("exclusive");

        let mut shared = PendingLock::create(&state, client(EngineKind::Cache), false).expect("create");
        let snapshot = shared.prepare().expect("prepare");
        assert_eq!(snapshot.blockers(), &[exclusive.id()]);

        let mut waiting = tokio::spawn(shared.acquire(snapshot));
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut waiting).await.is_err());

        exclusive.release();
        let lock = waiting.await.expect("task").expect("shared acquired");
        assert!(!lock.is_exclusive());
    }

    #[tokio::test]
    async fn invalidation_spares_the_caller() {
        let state = state();
        let held = PendingLock::create(&state, client(EngineKind::Blob), false)
            .expect("create")
            .open()
            .await
            .expect("held");

        let mut clear = PendingLock::create(&state, LockScope::universal(), true).expect("create");
        let snapshot = clear.prepare().expect("prepare");
        clear.invalidate_blockers(&snapshot);
        assert!(held.is_invalidated());

        drop(held);
        let clear = clear.acquire(snapshot).await.expect("clear");
        assert!(!clear.is_invalidated());
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_and_new_locks() {
        let state = state();
        let _held = PendingLock::create(&state, LockScope::universal(), true)
            .expect("create")
            .open()
            .await
            .expect("held");
        let waiting = tokio::spawn(
            PendingLock::create(&state, client(EngineKind::Cache), false).expect("create").open(),
        );
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        state.begin_shutdown();
        let err = waiting.await.expect("task").expect_err("rejected");
        assert!(matches!(err, QuotaError::Abort { .. }));
        assert!(PendingLock::create(&state, LockScope::universal(), false).is_err());
    }

    #[tokio::test]
    async fn dropped_pending_lock_leaves_the_queue() {
        let state = state();
        let mut pending = PendingLock::create(&state, LockScope::universal(), true).expect("create");
        pending.prepare().expect("prepare");
        assert!(pending.prepare().is_err());
        drop(pending);
        assert_eq!(state.with(|core| core.locks.len()), 0);
    }
}

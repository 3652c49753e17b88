//! The four-phase template every whole-storage operation runs through.
//!
//! `init` and `finish` run on the coordinator, the directory lock is opened on the coordinator,
//! and `do_work` runs on the worker pool with the operation moved there and back.

mod callbacks;
mod clear;
mod origin;
mod shutdown;
mod usage;

pub use callbacks::{CallbackOptions, OperationCallbacks, OperationListeners};
pub use clear::ClearTarget;
pub(crate) use clear::ClearOp;
pub(crate) use origin::{EstimateOp, PersistOp, PersistedOp};
pub(crate) use shutdown::ShutdownStorageOp;
pub(crate) use usage::{GetOriginUsageOp, GetUsageOp};

use crate::cache::UsageCache;
use crate::engine::StorageEngine;
use crate::error::QuotaError;
use crate::fs::Filesystem;
use crate::lock::{DirectoryLock, LockScope, PendingLock};
use crate::manager::ManagerInner;
use crate::state::SharedState;
use qhub_domain::EngineKind;
use std::sync::Arc;
use tracing::{trace, warn};

/// Where an operation is in its life cycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Created,
    Initializing,
    Opening,
    Working,
    Finishing,
    Done,
}

impl PipelineState {
    fn advance(&mut self, next: Self, op: &'static str) {
        debug_assert!(next > *self, "{op}: {self:?} -> {next:?}");
        trace!(op, from = ?*self, to = ?next, "Storage operation state");
        *self = next;
    }
}

/// The directory lock an operation holds from `Open` until `Finish`.
#[derive(Debug, Clone)]
pub(crate) struct LockRequest {
    pub(crate) scope: LockScope,
    pub(crate) exclusive: bool,
    /// Invalidate the locks this one waits on.
    pub(crate) invalidate_blockers: bool,
    /// Keep working after shutdown was flagged.
    pub(crate) bypass_shutdown: bool,
}

impl LockRequest {
    pub(crate) const fn shared(scope: LockScope) -> Self {
        Self { scope, exclusive: false, invalidate_blockers: false, bypass_shutdown: false }
    }

    pub(crate) const fn clearing(scope: LockScope) -> Self {
        Self { scope, exclusive: true, invalidate_blockers: true, bypass_shutdown: false }
    }
}

/// What `do_work` may touch on the worker pool.
#[derive(Debug, Clone)]
pub(crate) struct WorkContext {
    pub(crate) fs: Arc<dyn Filesystem>,
    pub(crate) engines: Vec<Arc<dyn StorageEngine>>,
    pub(crate) cache: Option<Arc<dyn UsageCache>>,
    pub(crate) state: Arc<SharedState>,
}

impl WorkContext {
    pub(crate) fn engine(&self, kind: EngineKind) -> Option<&Arc<dyn StorageEngine>> {
        self.engines.iter().find(|engine| engine.kind() == kind)
    }
}

pub(crate) trait StorageOperation: Send + Sized + 'static {
    type Output: Send + 'static;

    const NAME: &'static str;

    /// Runs the initializers the operation depends on, before any lock is requested.
    fn init(&mut self, inner: &Arc<ManagerInner>) -> impl Future<Output = Result<(), QuotaError>> + Send;

    fn lock_request(&self) -> Option<LockRequest>;

    /// Blocking work on the worker pool.
    fn do_work(&mut self, ctx: &WorkContext) -> Result<(), QuotaError>;

    /// Runs on the coordinator while the lock is still held, whatever the outcome.
    fn finish(&mut self, _inner: &ManagerInner, _outcome: &Result<(), QuotaError>) -> Result<(), QuotaError> {
        Ok(())
    }

    fn into_output(self) -> Self::Output;
}

/// Drives `op` through every phase. The first error wins; later phases still finish.
pub(crate) async fn execute<Op: StorageOperation>(
    inner: &Arc<ManagerInner>,
    mut op: Op,
    mut callbacks: OperationCallbacks,
) -> Result<Op::Output, QuotaError> {
    let mut state = PipelineState::Created;
    let mut error: Option<QuotaError> = None;
    let mut lock: Option<DirectoryLock> = None;

    state.advance(PipelineState::Initializing, Op::NAME);
    if let Err(err) = op.init(inner).await {
        error = Some(err);
    }

    if error.is_none() {
        state.advance(PipelineState::Opening, Op::NAME);
        if let Some(request) = op.lock_request() {
            match open(inner, request).await {
                Ok(acquired) => lock = Some(acquired),
                Err(err) => error = Some(err),
            }
        }
    }

    if error.is_none() {
        state.advance(PipelineState::Working, Op::NAME);
        let ctx = inner.work_context();
        let joined = inner
            .executors
            .spawn_io(move || {
                let result = op.do_work(&ctx);
                (op, result)
            })
            .await;
        match joined {
            Ok((returned, result)) => {
                op = returned;
                if let Err(err) = result {
                    error = Some(err);
                }
            },
            Err(join) => {
                callbacks.will_finish();
                drop(lock);
                callbacks.did_finish();
                return Err(QuotaError::internal(format!("{} worker task failed: {join}", Op::NAME)));
            },
        }
    }

    state.advance(PipelineState::Finishing, Op::NAME);
    let outcome = error.map_or(Ok(()), Err);
    let finished = op.finish(inner, &outcome);
    let outcome = outcome.and(finished);
    if let Err(err) = &outcome {
        warn!(op = Op::NAME, error = %err, "Storage operation failed");
    }

    callbacks.will_finish();
    drop(lock);
    callbacks.did_finish();
    state.advance(PipelineState::Done, Op::NAME);
    outcome.map(|()| op.into_output())
}

async fn open(inner: &ManagerInner, request: LockRequest) -> Result<DirectoryLock, QuotaError> {
    let mut pending = if request.bypass_shutdown {
        PendingLock::create_for_shutdown(&inner.state, request.scope, request.exclusive)
    } else {
        PendingLock::create(&inner.state, request.scope, request.exclusive)?
    };
    let snapshot = pending.prepare()?;
    if request.invalidate_blockers && !snapshot.is_empty() {
        pending.invalidate_blockers(&snapshot);
    }
    pending.acquire(snapshot).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockId;
    use crate::manager::QuotaManager;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    type Waiting = JoinHandle<Result<(DirectoryLock, bool), QuotaError>>;

    #[derive(Debug, Default)]
    struct Seen {
        blockers: Mutex<Vec<LockId>>,
        waiter: Mutex<Option<Waiting>>,
    }

    /// Fails in `do_work` and again in `finish`; `finish` queues a conflicting lock.
    #[derive(Debug)]
    struct FailingOp {
        seen: Arc<Seen>,
        will_finish: Option<oneshot::Receiver<()>>,
    }

    impl StorageOperation for FailingOp {
        type Output = ();

        const NAME: &'static str = "failing";

        async fn init(&mut self, _inner: &Arc<ManagerInner>) -> Result<(), QuotaError> {
            Ok(())
        }

        fn lock_request(&self) -> Option<LockRequest> {
            Some(LockRequest::clearing(LockScope::universal()))
        }

        fn do_work(&mut self, _ctx: &WorkContext) -> Result<(), QuotaError> {
            Err(QuotaError::abort("work failed"))
        }

        fn finish(&mut self, inner: &ManagerInner, outcome: &Result<(), QuotaError>) -> Result<(), QuotaError> {
            assert!(outcome.is_err());
            let mut waiter = PendingLock::create(&inner.state, LockScope::universal(), true)?;
            let snapshot = waiter.prepare()?;
            self.seen.blockers.lock().extend_from_slice(snapshot.blockers());

            let mut will_finish = self.will_finish.take();
            *self.seen.waiter.lock() = Some(tokio::spawn(async move {
                let lock = waiter.acquire(snapshot).await?;
                let fired = will_finish.as_mut().is_some_and(|rx| rx.try_recv().is_ok());
                Ok((lock, fired))
            }));
            Err(QuotaError::invalid("finish failed"))
        }

        fn into_output(self) {}
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finish_signals_bracket_the_release_and_the_first_error_wins() {
        let dir = TempDir::new().expect("tempdir");
        let manager = QuotaManager::builder().root(dir.path()).build().expect("manager");
        let seen = Arc::new(Seen::default());
        let (callbacks, listeners) =
            OperationCallbacks::new(CallbackOptions::WILL_FINISH | CallbackOptions::DID_FINISH);
        let op = FailingOp { seen: Arc::clone(&seen), will_finish: listeners.will_finish };

        let inner = Arc::clone(&manager.inner);
        let running = manager.inner.executors.coordinate(async move { execute(&inner, op, callbacks).await });

        listeners.did_finish.expect("did finish").await.expect("did finish fired");
        let held = seen.blockers.lock().clone();
        assert_eq!(held.len(), 1, "the operation's lock was held during finish");
        let still_held =
            manager.inner.state.with(|core| core.locks.acquired().any(|(id, _, _)| held.contains(&id)));
        assert!(!still_held, "did-finish fired before the release");

        let err = running.await.expect("task").expect_err("operation fails");
        assert!(matches!(err, QuotaError::Abort { .. }), "got {err:?}");

        let waiter = seen.waiter.lock().take().expect("waiter queued");
        let (lock, will_finish_fired) = waiter.await.expect("join").expect("waiter acquires");
        assert!(will_finish_fired, "will-finish fired before the conflicting lock acquired");
        assert!(lock.is_exclusive());
    }
}

use crate::error::QuotaError;
use crate::lock::{LockId, LockTable, Waiter};
use crate::usage::{Limits, UsageTree};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use qhub_domain::EngineKind;
use std::sync::atomic::{AtomicBool, Ordering};

/// Tables shared between the coordinator and the threads that drop locks or report usage.
#[derive(Debug)]
pub(crate) struct CoreState {
    pub(crate) locks: LockTable,
    pub(crate) usage: UsageTree,
}

/// The coarse mutex plus the shutdown flag.
#[derive(Debug)]
pub(crate) struct SharedState {
    core: Mutex<CoreState>,
    shutting_down: AtomicBool,
}

impl SharedState {
    pub(crate) fn new(limits: Limits) -> Self {
        Self {
            core: Mutex::new(CoreState { locks: LockTable::default(), usage: UsageTree::new(limits) }),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Runs `f` inside the critical section. `f` must not drop a lock handle.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut CoreState) -> R) -> R {
        f(&mut self.core.lock())
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_running(&self) -> Result<(), QuotaError> {
        if self.is_shutting_down() { Err(QuotaError::shutting_down()) } else { Ok(()) }
    }

    /// Parks `waiter` behind the blockers of `id`, or hands it back when the lock is free.
    pub(crate) fn try_acquire(
        &self,
        id: LockId,
        waiter: Waiter,
        bypass_shutdown: bool,
    ) -> Result<Option<Waiter>, QuotaError> {
        let mut core = self.core.lock();
        let shutting_down = !bypass_shutdown && self.is_shutting_down();
        core.locks.try_acquire(id, waiter, shutting_down)
    }

    /// Flags shutdown, rejects queued waiters and returns acquired locks grouped by engine.
    pub(crate) fn begin_shutdown(&self) -> FxHashMap<EngineKind, Vec<LockId>> {
        let (rejected, acquired) = {
            let mut core = self.core.lock();
            self.shutting_down.store(true, Ordering::Release);
            core.locks.begin_shutdown()
        };
        for waiter in rejected {
            let _ = waiter.send(Err(QuotaError::shutting_down()));
        }
        acquired
    }
}

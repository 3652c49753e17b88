use crate::error::QuotaError;
use crate::init::with_markers;
use crate::lock::LockScope;
use crate::manager::ManagerInner;
use crate::pipeline::{LockRequest, StorageOperation, WorkContext};
use std::sync::Arc;
use tracing::info;

/// Waits for every lock to drop, writes the usage cache and releases engine resources.
#[derive(Debug, Default)]
pub(crate) struct ShutdownStorageOp {
    temporary_initialized: bool,
    rows: usize,
}

impl StorageOperation for ShutdownStorageOp {
    type Output = bool;

    const NAME: &'static str = "shutdown-storage";

    async fn init(&mut self, inner: &Arc<ManagerInner>) -> Result<(), QuotaError> {
        self.temporary_initialized = with_markers(&inner.markers, |m| m.temporary.is_initialized(&()))?;
        Ok(())
    }

    fn lock_request(&self) -> Option<LockRequest> {
        Some(LockRequest {
            scope: LockScope::universal(),
            exclusive: true,
            invalidate_blockers: true,
            bypass_shutdown: true,
        })
    }

    fn do_work(&mut self, ctx: &WorkContext) -> Result<(), QuotaError> {
        if self.temporary_initialized && let Some(cache) = &ctx.cache {
            let rows = ctx.state.with(|core| core.usage.snapshot_rows());
            self.rows = rows.len();
            cache.store(&rows)?;
        }
        for engine in &ctx.engines {
            engine.release_worker_resources();
        }
        Ok(())
    }

    fn finish(&mut self, inner: &ManagerInner, _outcome: &Result<(), QuotaError>) -> Result<(), QuotaError> {
        inner.state.with(|core| core.usage.reset());
        with_markers(&inner.markers, |m| m.reset_all())?;
        info!(cached_rows = self.rows, "Storage shut down");
        Ok(())
    }

    fn into_output(self) -> bool {
        true
    }
}

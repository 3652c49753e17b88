use crate::error::QuotaError;
use crate::init;
use crate::layout;
use crate::lock::{LockScope, OriginScope};
use crate::manager::ManagerInner;
use crate::pipeline::{LockRequest, StorageOperation, WorkContext};
use crate::usage::{OriginUsage, UsageSnapshot};
use fxhash::FxHashMap;
use qhub_domain::{OriginKey, PersistenceKind, PrincipalKey};
use qhub_kernel::security::OriginGuard;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn measure(ctx: &WorkContext, key: &OriginKey) -> Result<UsageSnapshot, QuotaError> {
    let mut usage = UsageSnapshot::default();
    for engine in &ctx.engines {
        usage.add_engine(engine.kind(), engine.get_usage(ctx.fs.as_ref(), key)?);
    }
    Ok(usage)
}

fn cancelled(partial: UsageSnapshot) -> QuotaError {
    QuotaError::Cancelled { partial, context: None }
}

async fn initialize_repositories(inner: &Arc<ManagerInner>) -> Result<(), QuotaError> {
    init::initialize_persistent_storage(inner).await?;
    init::initialize_temporary_storage(inner).await?;
    Ok(())
}

/// Measures every origin directory on disk.
///
/// The usage tree only contributes access times and persisted flags; records of idle zero-usage
/// origins are pruned, so it cannot be the listing.
#[derive(Debug)]
pub(crate) struct GetUsageOp {
    all_origins: bool,
    cancel: CancellationToken,
    known: FxHashMap<OriginKey, OriginUsage>,
    rows: Vec<OriginUsage>,
}

impl GetUsageOp {
    pub(crate) fn new(all_origins: bool, cancel: CancellationToken) -> Self {
        Self { all_origins, cancel, known: FxHashMap::default(), rows: Vec::new() }
    }

    fn listed(
        &self,
        ctx: &WorkContext,
        kind: PersistenceKind,
        name: &str,
    ) -> Result<Option<OriginUsage>, QuotaError> {
        let Some(metadata) = ctx.fs.read_metadata(&layout::repository_dir(kind).join(name))? else {
            return Ok(None);
        };
        if metadata.key.persistence != kind
            || (!self.all_origins && OriginGuard::is_internal(&metadata.key.origin))
        {
            return Ok(None);
        }
        let (persisted, access_time) = self.known.get(&metadata.key).map_or(
            (metadata.persisted, metadata.last_access),
            |row| (row.persisted || metadata.persisted, row.access_time.max(metadata.last_access)),
        );
        let usage = measure(ctx, &metadata.key)?;
        Ok(Some(OriginUsage { key: metadata.key, usage, persisted, access_time }))
    }
}

impl StorageOperation for GetUsageOp {
    type Output = Vec<OriginUsage>;

    const NAME: &'static str = "get-usage";

    async fn init(&mut self, inner: &Arc<ManagerInner>) -> Result<(), QuotaError> {
        initialize_repositories(inner).await?;
        let rows = inner.state.with(|core| core.usage.rows());
        self.known = rows.into_iter().map(|row| (row.key.clone(), row)).collect();
        Ok(())
    }

    fn lock_request(&self) -> Option<LockRequest> {
        Some(LockRequest::shared(LockScope::universal()))
    }

    fn do_work(&mut self, ctx: &WorkContext) -> Result<(), QuotaError> {
        let mut partial = UsageSnapshot::default();
        for kind in PersistenceKind::ALL {
            for name in ctx.fs.list_directories(&layout::repository_dir(kind))? {
                if self.cancel.is_cancelled() {
                    return Err(cancelled(partial));
                }
                if let Some(row) = self.listed(ctx, kind, &name)? {
                    partial += row.usage;
                    self.rows.push(row);
                }
            }
        }
        self.rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(())
    }

    fn into_output(self) -> Vec<OriginUsage> {
        self.rows
    }
}

/// Measures one principal across every persistence kind.
#[derive(Debug)]
pub(crate) struct GetOriginUsageOp {
    principal: PrincipalKey,
    cancel: CancellationToken,
    total: UsageSnapshot,
}

impl GetOriginUsageOp {
    pub(crate) fn new(principal: PrincipalKey, cancel: CancellationToken) -> Self {
        Self { principal, cancel, total: UsageSnapshot::default() }
    }
}

impl StorageOperation for GetOriginUsageOp {
    type Output = UsageSnapshot;

    const NAME: &'static str = "get-origin-usage";

    async fn init(&mut self, inner: &Arc<ManagerInner>) -> Result<(), QuotaError> {
        initialize_repositories(inner).await
    }

    fn lock_request(&self) -> Option<LockRequest> {
        Some(LockRequest::shared(LockScope {
            persistence: None,
            origin: OriginScope::Origin(self.principal.full_origin()),
            engine: None,
        }))
    }

    fn do_work(&mut self, ctx: &WorkContext) -> Result<(), QuotaError> {
        for kind in PersistenceKind::ALL {
            if self.cancel.is_cancelled() {
                return Err(cancelled(self.total));
            }
            self.total += measure(ctx, &self.principal.with_persistence(kind))?;
        }
        Ok(())
    }

    fn into_output(self) -> UsageSnapshot {
        self.total
    }
}

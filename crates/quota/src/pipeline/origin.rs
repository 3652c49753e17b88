use crate::error::QuotaError;
use crate::fs::OriginMetadata;
use crate::init;
use crate::layout;
use crate::lock::LockScope;
use crate::manager::ManagerInner;
use crate::pipeline::{LockRequest, StorageOperation, WorkContext};
use crate::usage::{Estimate, now};
use qhub_domain::{OriginKey, PersistenceKind, PrincipalKey};
use std::sync::Arc;
use tracing::info;

/// Marks an origin of the default repository persisted, exempting it from eviction.
#[derive(Debug)]
pub(crate) struct PersistOp {
    key: OriginKey,
    changed: bool,
}

impl PersistOp {
    pub(crate) fn new(principal: &PrincipalKey) -> Self {
        Self { key: principal.with_persistence(PersistenceKind::Default), changed: false }
    }
}

impl StorageOperation for PersistOp {
    type Output = bool;

    const NAME: &'static str = "persist";

    async fn init(&mut self, inner: &Arc<ManagerInner>) -> Result<(), QuotaError> {
        init::initialize_origin(inner, &self.key, true).await?;
        Ok(())
    }

    fn lock_request(&self) -> Option<LockRequest> {
        Some(LockRequest {
            scope: LockScope::origin(&self.key),
            exclusive: true,
            invalidate_blockers: false,
            bypass_shutdown: false,
        })
    }

    fn do_work(&mut self, ctx: &WorkContext) -> Result<(), QuotaError> {
        let dir = layout::origin_dir(&self.key);
        let mut metadata = ctx.fs.read_metadata(&dir)?.unwrap_or_else(|| OriginMetadata {
            key: self.key.clone(),
            persisted: false,
            last_access: now(),
        });
        if !metadata.persisted {
            metadata.persisted = true;
            ctx.fs.write_metadata(&dir, &metadata)?;
            self.changed = true;
        }
        Ok(())
    }

    fn finish(&mut self, inner: &ManagerInner, outcome: &Result<(), QuotaError>) -> Result<(), QuotaError> {
        if outcome.is_ok() {
            inner.state.with(|core| core.usage.persist(&self.key, now()));
            if self.changed {
                info!(origin = %self.key, "Origin persisted");
            }
        }
        Ok(())
    }

    fn into_output(self) -> bool {
        self.changed
    }
}

/// Reads the persisted flag of an origin of the default repository.
#[derive(Debug)]
pub(crate) struct PersistedOp {
    key: OriginKey,
    persisted: bool,
}

impl PersistedOp {
    pub(crate) fn new(principal: &PrincipalKey) -> Self {
        Self { key: principal.with_persistence(PersistenceKind::Default), persisted: false }
    }
}

impl StorageOperation for PersistedOp {
    type Output = bool;

    const NAME: &'static str = "persisted";

    async fn init(&mut self, inner: &Arc<ManagerInner>) -> Result<(), QuotaError> {
        init::initialize_origin(inner, &self.key, false).await?;
        Ok(())
    }

    fn lock_request(&self) -> Option<LockRequest> {
        Some(LockRequest::shared(LockScope::origin(&self.key)))
    }

    fn do_work(&mut self, ctx: &WorkContext) -> Result<(), QuotaError> {
        let metadata = ctx.fs.read_metadata(&layout::origin_dir(&self.key))?;
        self.persisted = metadata.is_some_and(|m| m.persisted);
        Ok(())
    }

    fn into_output(self) -> bool {
        self.persisted
    }
}

/// Group usage and the ceiling that applies to the principal.
#[derive(Debug)]
pub(crate) struct EstimateOp {
    principal: PrincipalKey,
    estimate: Estimate,
}

impl EstimateOp {
    pub(crate) const fn new(principal: PrincipalKey) -> Self {
        Self { principal, estimate: Estimate { usage: 0, limit: 0 } }
    }
}

impl StorageOperation for EstimateOp {
    type Output = Estimate;

    const NAME: &'static str = "estimate";

    async fn init(&mut self, inner: &Arc<ManagerInner>) -> Result<(), QuotaError> {
        init::initialize_group(inner, &self.principal).await?;
        Ok(())
    }

    fn lock_request(&self) -> Option<LockRequest> {
        None
    }

    fn do_work(&mut self, _ctx: &WorkContext) -> Result<(), QuotaError> {
        Ok(())
    }

    fn finish(&mut self, inner: &ManagerInner, outcome: &Result<(), QuotaError>) -> Result<(), QuotaError> {
        if outcome.is_err() {
            return Ok(());
        }
        let default = self.principal.with_persistence(PersistenceKind::Default);
        self.estimate = inner.state.with(|core| {
            let limits = core.usage.limits();
            let persisted = core.usage.is_persisted(&default).unwrap_or(false);
            Estimate {
                usage: core.usage.group_usage(&self.principal.group),
                limit: if persisted { limits.global } else { limits.group },
            }
        });
        Ok(())
    }

    fn into_output(self) -> Estimate {
        self.estimate
    }
}

use crate::error::QuotaError;
use crate::init::{self, with_markers};
use crate::layout;
use crate::lock::{LockScope, OriginPattern, OriginScope};
use crate::manager::ManagerInner;
use crate::pipeline::{LockRequest, StorageOperation, WorkContext};
use fxhash::FxHashMap;
use qhub_domain::{EngineKind, PersistenceKind, PrincipalKey};
use qhub_kernel::security::OriginGuard;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// What a clear operation removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearTarget {
    /// One origin, under one persistence kind or all of them.
    Origin { principal: PrincipalKey, persistence: Option<PersistenceKind> },
    /// One engine's data of one origin.
    Engine { principal: PrincipalKey, persistence: Option<PersistenceKind>, engine: EngineKind },
    /// Every origin whose full origin string starts with the prefix.
    Prefix(String),
    /// Every origin whose suffix carries the pattern's attributes.
    Pattern(OriginPattern),
    /// The private-browsing repository.
    Private,
    All,
}

impl ClearTarget {
    #[must_use]
    pub fn scope(&self) -> LockScope {
        match self {
            Self::Origin { principal, persistence } => LockScope {
                persistence: *persistence,
                origin: OriginScope::Origin(principal.full_origin()),
                engine: None,
            },
            Self::Engine { principal, persistence, engine } => LockScope {
                persistence: *persistence,
                origin: OriginScope::Origin(principal.full_origin()),
                engine: Some(*engine),
            },
            Self::Prefix(prefix) => {
                LockScope { origin: OriginScope::Prefix(prefix.clone()), ..LockScope::universal() }
            },
            Self::Pattern(pattern) => {
                LockScope { origin: OriginScope::Pattern(pattern.clone()), ..LockScope::universal() }
            },
            Self::Private => LockScope::repository(PersistenceKind::Private),
            Self::All => LockScope::universal(),
        }
    }
}

impl fmt::Display for ClearTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scope())
    }
}

/// A directory the operation deleted.
#[derive(Debug)]
struct Removed {
    persistence: PersistenceKind,
    directory: String,
    bytes: u64,
}

#[derive(Debug)]
pub(crate) struct ClearOp {
    target: ClearTarget,
    scope: LockScope,
    removed: Vec<Removed>,
}

impl ClearOp {
    pub(crate) fn new(target: ClearTarget) -> Self {
        let scope = target.scope();
        Self { target, scope, removed: Vec::new() }
    }

    fn clear_all(&mut self, ctx: &WorkContext) -> Result<(), QuotaError> {
        for kind in PersistenceKind::ALL {
            let repository = layout::repository_dir(kind);
            let bytes = ctx.fs.directory_size(&repository)?;
            if ctx.fs.delete_recursive(&repository)? {
                self.removed.push(Removed { persistence: kind, directory: String::new(), bytes });
            }
        }
        if let Some(cache) = &ctx.cache {
            cache.invalidate()?;
        }
        Ok(())
    }

    fn clear_engine(
        &mut self,
        ctx: &WorkContext,
        kind: PersistenceKind,
        name: &str,
        engine: EngineKind,
    ) -> Result<(), QuotaError> {
        let fs = ctx.fs.as_ref();
        let origin_dir = layout::repository_dir(kind).join(name);
        let dir = origin_dir.join(engine.as_str());
        if !fs.exists(&dir)? {
            return Ok(());
        }
        let bytes = fs.directory_size(&dir)?;
        if let (Some(metadata), Some(handler)) = (fs.read_metadata(&origin_dir)?, ctx.engine(engine)) {
            handler.delete_origin(fs, &metadata.key)?;
        }
        fs.delete_recursive(&dir)?;
        self.removed.push(Removed { persistence: kind, directory: name.to_owned(), bytes });
        Ok(())
    }

    fn clear_origin(&mut self, ctx: &WorkContext, kind: PersistenceKind, name: &str) -> Result<(), QuotaError> {
        let fs = ctx.fs.as_ref();
        let dir = layout::repository_dir(kind).join(name);
        let bytes = fs.directory_size(&dir)?;
        if let Some(metadata) = fs.read_metadata(&dir)? {
            for engine in &ctx.engines {
                engine.delete_origin(fs, &metadata.key)?;
            }
        }
        if fs.delete_recursive(&dir)? {
            self.removed.push(Removed { persistence: kind, directory: name.to_owned(), bytes });
        }
        Ok(())
    }
}

impl StorageOperation for ClearOp {
    type Output = bool;

    const NAME: &'static str = "clear";

    async fn init(&mut self, inner: &Arc<ManagerInner>) -> Result<(), QuotaError> {
        init::initialize_storage(inner).await?;
        if self.target == ClearTarget::All {
            return Ok(());
        }
        if self.scope.kinds().any(PersistenceKind::is_best_effort) {
            init::initialize_temporary_storage(inner).await?;
        }
        if self.scope.kinds().any(|kind| !kind.is_best_effort()) {
            init::initialize_persistent_storage(inner).await?;
        }
        Ok(())
    }

    fn lock_request(&self) -> Option<LockRequest> {
        Some(LockRequest::clearing(self.scope.clone()))
    }

    fn do_work(&mut self, ctx: &WorkContext) -> Result<(), QuotaError> {
        if self.target == ClearTarget::All {
            return self.clear_all(ctx);
        }
        let kinds: Vec<PersistenceKind> = self.scope.kinds().collect();
        for kind in kinds {
            for name in ctx.fs.list_directories(&layout::repository_dir(kind))? {
                if !self.scope.origin.matches_directory(&name) {
                    continue;
                }
                match self.scope.engine {
                    Some(engine) => self.clear_engine(ctx, kind, &name, engine)?,
                    None => self.clear_origin(ctx, kind, &name)?,
                }
            }
        }
        Ok(())
    }

    /// Drops the tree records of what was deleted. A failed run only forgets the directories it
    /// removed before the failure.
    fn finish(&mut self, inner: &ManagerInner, outcome: &Result<(), QuotaError>) -> Result<(), QuotaError> {
        let complete = outcome.is_ok();
        if self.target == ClearTarget::All {
            let repositories: Vec<PersistenceKind> = self.removed.iter().map(|r| r.persistence).collect();
            inner.state.with(|core| {
                if complete {
                    core.usage.reset();
                    return;
                }
                for kind in repositories {
                    for key in core.usage.keys_in(&LockScope::repository(kind)) {
                        core.usage.remove_origin(&key);
                    }
                }
            });
            with_markers(&inner.markers, |m| m.reset_all())?;
            info!(directories = self.removed.len(), "All storage cleared");
            return Ok(());
        }

        let scope = &self.scope;
        let measured: FxHashMap<(PersistenceKind, &str), u64> =
            self.removed.iter().map(|r| ((r.persistence, r.directory.as_str()), r.bytes)).collect();
        inner.state.with(|core| {
            for key in core.usage.keys_in(scope) {
                let directory = OriginGuard::sanitize(&key.full_origin());
                let deleted = measured.get(&(key.persistence, directory.as_str())).copied();
                if !complete && deleted.is_none() {
                    continue;
                }
                match scope.engine {
                    Some(engine) => core.usage.clear_engine(&key, engine, deleted.unwrap_or(0)),
                    None => {
                        core.usage.remove_origin(&key);
                    },
                }
            }
        });

        with_markers(&inner.markers, |m| {
            let covered = |persistence: PersistenceKind, full: &str| scope.covers_origin(persistence, full);
            if scope.engine.is_none() {
                m.origins.reset_where(|key| covered(key.persistence, &key.full_origin()));
            }
            m.clients.reset_where(|client| {
                covered(client.origin.persistence, &client.origin.full_origin())
                    && scope.engine.is_none_or(|engine| engine == client.engine)
            });
            m.groups.reset_all();
        })?;

        let bytes: u64 = self.removed.iter().map(|r| r.bytes).sum();
        info!(target_scope = %self.target, directories = self.removed.len(), bytes, "Storage cleared");
        Ok(())
    }

    fn into_output(self) -> bool {
        !self.removed.is_empty()
    }
}

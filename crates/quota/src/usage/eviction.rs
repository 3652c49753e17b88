use crate::error::QuotaError;
use crate::init::with_markers;
use crate::layout;
use crate::lock::{DirectoryLock, LockScope};
use crate::manager::ManagerInner;
use crate::state::SharedState;
use crate::usage::Overage;
use qhub_domain::OriginKey;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// An origin picked for eviction, with the exclusive lock taken on it.
#[derive(Debug)]
pub(crate) struct Victim {
    pub(crate) key: OriginKey,
    pub(crate) usage: u64,
    pub(crate) lock: DirectoryLock,
}

/// Selects victims for `overage` and locks them in the same critical section, so no other lock
/// can slip in between the check and the registration.
pub(crate) fn collect_for_eviction(state: &Arc<SharedState>, overage: &Overage) -> Vec<Victim> {
    if state.is_shutting_down() {
        return Vec::new();
    }
    let picked = state.with(|core| {
        let victims = core.usage.select_victims(overage, |p, origin| core.locks.is_locked(p, origin));
        victims
            .into_iter()
            .map(|(key, usage)| {
                let scope = LockScope::origin(&key);
                let flag = Arc::new(AtomicBool::new(false));
                let (id, blockers) = core.locks.register(scope.clone(), true, Arc::clone(&flag));
                debug_assert!(blockers.is_empty(), "eviction victim {key} was locked");
                core.locks.mark_acquired(id);
                (key, usage, id, scope, flag)
            })
            .collect::<Vec<_>>()
    });

    picked
        .into_iter()
        .map(|(key, usage, id, scope, flag)| Victim {
            key,
            usage,
            lock: DirectoryLock::acquired(Arc::clone(state), id, scope, flag),
        })
        .collect()
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Evicts until no ceiling is exceeded or no candidate is left. Returns the bytes freed.
///
/// Only one pass runs at a time; a second caller returns 0 immediately.
pub(crate) async fn enforce_limits(inner: &Arc<ManagerInner>) -> Result<u64, QuotaError> {
    if inner.evicting.swap(true, Ordering::AcqRel) {
        return Ok(0);
    }
    let _guard = PassGuard(&inner.evicting);

    let mut total = 0_u64;
    while let Some(overage) = inner.state.with(|core| core.usage.over_limit()) {
        let freed = evict(inner, &overage).await?;
        if freed == 0 {
            warn!(?overage, "No evictable origin left");
            break;
        }
        total = total.saturating_add(freed);
    }
    if total > 0 {
        info!(bytes = total, "Eviction pass finished");
    }
    Ok(total)
}

/// Deletes the victims selected for `overage`. Returns the bytes their records accounted for.
pub(crate) async fn evict(inner: &Arc<ManagerInner>, overage: &Overage) -> Result<u64, QuotaError> {
    let victims = collect_for_eviction(&inner.state, overage);
    if victims.is_empty() {
        return Ok(0);
    }
    let selected: u64 = victims.iter().map(|v| v.usage).sum();
    debug!(victims = victims.len(), bytes = selected, requested = overage.excess(), "Evicting origins");

    let keys: Vec<OriginKey> = victims.iter().map(|v| v.key.clone()).collect();
    let engines = inner.engines.clone();
    let (deleted, failure) = inner
        .blocking(move |fs| {
            let mut deleted = Vec::with_capacity(keys.len());
            for key in keys {
                let result = engines
                    .iter()
                    .try_for_each(|engine| engine.delete_origin(fs, &key).map(drop))
                    .and_then(|()| fs.delete_recursive(&layout::origin_dir(&key)));
                if let Err(err) = result {
                    return Ok((deleted, Some(err)));
                }
                deleted.push(key);
            }
            Ok((deleted, None))
        })
        .await?;

    let freed: u64 = inner.state.with(|core| deleted.iter().map(|key| core.usage.remove_origin(key)).sum());
    with_markers(&inner.markers, |m| {
        for key in &deleted {
            m.reset_origin(key);
        }
        m.groups.reset_all();
    })?;
    for victim in victims.iter().filter(|v| deleted.contains(&v.key)) {
        info!(origin = %victim.key, bytes = victim.usage, lock = victim.lock.id(), "Origin evicted");
    }
    if let Some(err) = failure {
        warn!(evicted = deleted.len(), bytes = freed, error = %err, "Eviction stopped early");
        return Err(err);
    }
    drop(victims);
    Ok(freed)
}

use crate::error::QuotaError;
use crate::lock::scope::LockScope;
use fxhash::FxHashMap;
use qhub_domain::{EngineKind, PersistenceKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Registration order of a lock. Lower ids were registered first.
pub type LockId = u64;

pub(crate) type Waiter = oneshot::Sender<Result<(), QuotaError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Registered, waiting for `pending` blockers to drop.
    Queued,
    Acquired,
}

#[derive(Debug)]
struct LockEntry {
    scope: LockScope,
    exclusive: bool,
    state: EntryState,
    /// Earlier conflicting locks that have not dropped yet.
    pending: usize,
    /// Later locks waiting on this one.
    blocking: Vec<LockId>,
    waiter: Option<Waiter>,
    invalidated: Arc<AtomicBool>,
}

/// What a successful drop released.
#[derive(Debug)]
pub(crate) struct Released {
    pub(crate) scope: LockScope,
    pub(crate) ready: Vec<Waiter>,
}

/// The table of every registered directory lock, kept in registration order.
///
/// Lives inside the coarse state mutex, so every method runs in one critical section.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    next_id: LockId,
    entries: BTreeMap<LockId, LockEntry>,
}

impl LockTable {
    /// Registers a lock and returns its id with the ids of the earlier locks it conflicts with.
    pub(crate) fn register(
        &mut self,
        scope: LockScope,
        exclusive: bool,
        invalidated: Arc<AtomicBool>,
    ) -> (LockId, Vec<LockId>) {
        self.next_id += 1;
        let id = self.next_id;

        let blockers: Vec<LockId> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                (exclusive || entry.exclusive) && entry.scope.intersects(&scope)
            })
            .map(|(other, _)| *other)
            .collect();

        for blocker in &blockers {
            if let Some(entry) = self.entries.get_mut(blocker) {
                entry.blocking.push(id);
            }
        }

        debug!(lock = id, %scope, exclusive, blockers = blockers.len(), "Directory lock registered");
        self.entries.insert(
            id,
            LockEntry {
                scope,
                exclusive,
                state: EntryState::Queued,
                pending: blockers.len(),
                blocking: Vec::new(),
                waiter: None,
                invalidated,
            },
        );
        (id, blockers)
    }

    /// Marks `id` acquired when nothing blocks it, otherwise parks `waiter`.
    ///
    /// Returns the waiter back when the lock is already free.
    pub(crate) fn try_acquire(
        &mut self,
        id: LockId,
        waiter: Waiter,
        shutting_down: bool,
    ) -> Result<Option<Waiter>, QuotaError> {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Err(QuotaError::internal(format!("acquiring unregistered lock {id}")));
        };
        if entry.pending == 0 {
            entry.state = EntryState::Acquired;
            debug!(lock = id, "Directory lock acquired");
            return Ok(Some(waiter));
        }
        if shutting_down {
            return Err(QuotaError::shutting_down());
        }
        entry.waiter = Some(waiter);
        Ok(None)
    }

    pub(crate) fn mark_acquired(&mut self, id: LockId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = EntryState::Acquired;
            debug!(lock = id, "Directory lock acquired after wait");
        }
    }

    /// Removes `id` and unblocks the locks waiting on it.
    ///
    /// A second drop of the same id finds nothing and returns `None` without touching waiters.
    pub(crate) fn release(&mut self, id: LockId) -> Option<Released> {
        let Some(entry) = self.entries.remove(&id) else {
            if cfg!(debug_assertions) {
                error!(lock = id, "Directory lock dropped twice");
            } else {
                warn!(lock = id, "Directory lock dropped twice");
            }
            return None;
        };

        let mut ready = Vec::new();
        for waiting in entry.blocking {
            let Some(next) = self.entries.get_mut(&waiting) else {
                continue;
            };
            next.pending = next.pending.saturating_sub(1);
            if next.pending == 0 {
                next.state = EntryState::Acquired;
                if let Some(waiter) = next.waiter.take() {
                    ready.push(waiter);
                }
            }
        }

        debug!(lock = id, scope = %entry.scope, unblocked = ready.len(), "Directory lock dropped");
        Some(Released { scope: entry.scope, ready })
    }

    /// Invalidates `id` and every still-queued lock transitively waiting on it, except `skip`.
    pub(crate) fn invalidate(&self, id: LockId, skip: Option<LockId>) {
        let mut stack = vec![id];
        let mut seen = Vec::new();
        while let Some(current) = stack.pop() {
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            let Some(entry) = self.entries.get(&current) else {
                continue;
            };
            if current != id && entry.state != EntryState::Queued {
                continue;
            }
            if Some(current) != skip {
                entry.invalidated.store(true, Ordering::Release);
            }
            stack.extend(entry.blocking.iter().copied());
        }
        debug!(lock = id, count = seen.len(), "Directory locks invalidated");
    }

    /// Whether any registered lock reaches the directory of the given origin.
    pub(crate) fn is_locked(&self, persistence: PersistenceKind, full_origin: &str) -> bool {
        self.entries.values().any(|entry| entry.scope.covers_origin(persistence, full_origin))
    }

    /// Rejects queued waiters and groups acquired locks by the engines they reach.
    pub(crate) fn begin_shutdown(&mut self) -> (Vec<Waiter>, FxHashMap<EngineKind, Vec<LockId>>) {
        let mut rejected = Vec::new();
        let mut acquired: FxHashMap<EngineKind, Vec<LockId>> = FxHashMap::default();

        for (id, entry) in &mut self.entries {
            match entry.state {
                EntryState::Queued => rejected.extend(entry.waiter.take()),
                EntryState::Acquired => match entry.scope.engine {
                    Some(engine) => acquired.entry(engine).or_default().push(*id),
                    None => {
                        for engine in EngineKind::ALL {
                            acquired.entry(engine).or_default().push(*id);
                        }
                    },
                },
            }
        }
        (rejected, acquired)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn acquired(&self) -> impl Iterator<Item = (LockId, &LockScope, bool)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Acquired)
            .map(|(id, e)| (*id, &e.scope, e.exclusive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::scope::OriginScope;
    use proptest::prelude::*;
    use qhub_domain::PrincipalKey;

    fn client(origin: &str, engine: EngineKind) -> LockScope {
        let key = PrincipalKey::new(origin, "a.com", "").with_persistence(PersistenceKind::Default);
        LockScope::client(&key.client(engine))
    }

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn shared_locks_never_block_each_other() {
        let mut table = LockTable::default();
        let (_, a) = table.register(client("https://a.com", EngineKind::Document), false, flag());
        let (_, b) = table.register(LockScope::universal(), false, flag());
        assert!(a.is_empty() && b.is_empty());
    }

    #[test]
    fn release_unblocks_in_order_and_is_idempotent() {
        let mut table = LockTable::default();
        let (first, _) = table.register(client("https://a.com", EngineKind::Cache), true, flag());
        let (second, blockers) = table.register(client("https://a.com", EngineKind::Cache), false, flag());
        assert_eq!(blockers, vec![first]);

        let (tx, mut rx) = oneshot::channel();
        assert!(table.try_acquire(second, tx, false).expect("queued").is_none());

        let released = table.release(first).expect("first drop");
        assert_eq!(released.ready.len(), 1);
        for waiter in released.ready {
            waiter.send(Ok(())).expect("receiver alive");
        }
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));

        assert!(table.release(first).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn invalidation_reaches_queued_descendants_only() {
        let mut table = LockTable::default();
        let held = flag();
        let queued = flag();
        let clearing = flag();
        let (a, _) = table.register(client("https://a.com", EngineKind::Blob), false, held.clone());
        let (tx, _rx) = oneshot::channel();
        assert!(table.try_acquire(a, tx, false).expect("free").is_some());

        let scope = LockScope { origin: OriginScope::Prefix("https://a".to_owned()), ..LockScope::universal() };
        let (b, _) = table.register(scope, true, clearing.clone());
        let (_, _) = table.register(client("https://a.com", EngineKind::Blob), false, queued.clone());

        table.invalidate(a, Some(b));
        assert!(held.load(Ordering::Acquire));
        assert!(!clearing.load(Ordering::Acquire));
        assert!(queued.load(Ordering::Acquire));
    }

    #[test]
    fn shutdown_rejects_waiters_and_routes_acquired_locks() {
        let mut table = LockTable::default();
        let (a, _) = table.register(client("https://a.com", EngineKind::KeyValue), true, flag());
        let (tx, _rx) = oneshot::channel();
        table.try_acquire(a, tx, false).expect("free");
        let (b, _) = table.register(client("https://a.com", EngineKind::KeyValue), true, flag());
        let (tx, _rx) = oneshot::channel();
        table.try_acquire(b, tx, false).expect("queued");

        let (rejected, acquired) = table.begin_shutdown();
        assert_eq!(rejected.len(), 1);
        assert_eq!(acquired.get(&EngineKind::KeyValue), Some(&vec![a]));
        assert!(acquired.get(&EngineKind::Cache).is_none());

        let (c, _) = table.register(client("https://a.com", EngineKind::KeyValue), true, flag());
        let (tx, _rx) = oneshot::channel();
        assert!(matches!(table.try_acquire(c, tx, true), Err(QuotaError::Abort { .. })));
    }

    fn scopes() -> Vec<LockScope> {
        let a = PrincipalKey::new("https://a.com", "a.com", "").with_persistence(PersistenceKind::Default);
        let b = PrincipalKey::new("https://b.com", "b.com", "").with_persistence(PersistenceKind::Temporary);
        vec![
            LockScope::universal(),
            LockScope::repository(PersistenceKind::Default),
            LockScope::origin(&a),
            LockScope::client(&a.client(EngineKind::Cache)),
            LockScope::client(&a.client(EngineKind::Blob)),
            LockScope::origin(&b),
            LockScope { origin: OriginScope::Prefix("https://a".to_owned()), ..LockScope::universal() },
        ]
    }

    #[derive(Debug, Clone)]
    enum Step {
        Lock(usize, bool),
        Drop(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0..7_usize, any::<bool>()).prop_map(|(scope, exclusive)| Step::Lock(scope, exclusive)),
            (0..16_usize).prop_map(Step::Drop),
        ]
    }

    proptest! {
        #[test]
        fn acquired_locks_never_conflict(steps in prop::collection::vec(step(), 1..48)) {
            let scopes = scopes();
            let mut table = LockTable::default();
            let mut live: Vec<LockId> = Vec::new();
            let mut receivers = Vec::new();

            for step in steps {
                match step {
                    Step::Lock(scope, exclusive) => {
                        let (id, _) = table.register(scopes[scope].clone(), exclusive, flag());
                        let (tx, rx) = oneshot::channel();
                        table.try_acquire(id, tx, false).expect("registered");
                        receivers.push(rx);
                        live.push(id);
                    },
                    Step::Drop(index) if !live.is_empty() => {
                        let id = live.remove(index % live.len());
                        prop_assert!(table.release(id).is_some());
                    },
                    Step::Drop(_) => {},
                }

                let acquired: Vec<_> = table.acquired().collect();
                for (i, (a, scope_a, exclusive_a)) in acquired.iter().enumerate() {
                    for (b, scope_b, exclusive_b) in &acquired[i + 1..] {
                        prop_assert!(
                            !((*exclusive_a || *exclusive_b) && scope_a.intersects(scope_b)),
                            "locks {} and {} are both held",
                            a,
                            b
                        );
                    }
                }
            }
            prop_assert_eq!(table.len(), live.len());
        }
    }
}

use crate::error::QuotaError;
use fxhash::FxHashMap;
use qhub_domain::{ClientKey, OriginKey};
use qhub_runtime::{CoordinatorToken, ThreadBound};
use std::hash::Hash;
use tokio::sync::watch;

type Outcome<V> = Option<Result<V, QuotaError>>;

#[derive(Debug)]
enum Slot<V> {
    Initializing(watch::Receiver<Outcome<V>>),
    Initialized(V),
}

enum Begin<V> {
    Done(V),
    Attach(watch::Receiver<Outcome<V>>),
    Lead(watch::Sender<Outcome<V>>),
}

/// Per-key attempt markers: absent, initializing (shared attempt) or initialized (memoized).
#[derive(Debug)]
pub(crate) struct InitTracker<K, V> {
    slots: FxHashMap<K, Slot<V>>,
}

impl<K, V> Default for InitTracker<K, V> {
    fn default() -> Self {
        Self { slots: FxHashMap::default() }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> InitTracker<K, V> {
    pub(crate) fn get(&self, key: &K) -> Option<V> {
        match self.slots.get(key) {
            Some(Slot::Initialized(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_initialized(&self, key: &K) -> bool {
        matches!(self.slots.get(key), Some(Slot::Initialized(_)))
    }

    /// Records a value produced outside an attempt, e.g. by a repository scan.
    pub(crate) fn mark_initialized(&mut self, key: K, value: V) {
        self.slots.entry(key).or_insert(Slot::Initialized(value));
    }

    /// Forgets a finished initialization. In-flight attempts are left alone.
    pub(crate) fn reset(&mut self, key: &K) {
        if self.is_initialized(key) {
            self.slots.remove(key);
        }
    }

    pub(crate) fn reset_where(&mut self, mut matches: impl FnMut(&K) -> bool) {
        self.slots.retain(|key, slot| !(matches!(slot, Slot::Initialized(_)) && matches(key)));
    }

    pub(crate) fn reset_all(&mut self) {
        self.reset_where(|_| true);
    }

    fn begin(&mut self, key: &K) -> Begin<V> {
        match self.slots.get(key) {
            Some(Slot::Initialized(value)) => Begin::Done(value.clone()),
            Some(Slot::Initializing(rx)) => Begin::Attach(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                self.slots.insert(key.clone(), Slot::Initializing(rx));
                Begin::Lead(tx)
            },
        }
    }

    fn complete(&mut self, key: &K, value: Option<V>) {
        if matches!(self.slots.get(key), Some(Slot::Initializing(_))) {
            match value {
                Some(value) => {
                    self.slots.insert(key.clone(), Slot::Initialized(value));
                },
                None => {
                    self.slots.remove(key);
                },
            }
        }
    }
}

/// Every attempt marker of the manager. Coordinator-only.
#[derive(Debug, Default)]
pub(crate) struct InitMarkers {
    pub(crate) storage: InitTracker<(), ()>,
    pub(crate) persistent: InitTracker<(), ()>,
    pub(crate) temporary: InitTracker<(), ()>,
    pub(crate) groups: InitTracker<String, ()>,
    /// Whether the origin directory exists.
    pub(crate) origins: InitTracker<OriginKey, bool>,
    pub(crate) clients: InitTracker<ClientKey, ()>,
}

impl InitMarkers {
    pub(crate) fn reset_origin(&mut self, key: &OriginKey) {
        self.origins.reset(key);
        self.clients.reset_where(|client| &client.origin == key);
    }

    pub(crate) fn reset_all(&mut self) {
        self.storage.reset_all();
        self.persistent.reset_all();
        self.temporary.reset_all();
        self.groups.reset_all();
        self.origins.reset_all();
        self.clients.reset_all();
    }
}

pub(crate) type Select<K, V> = fn(&mut InitMarkers) -> &mut InitTracker<K, V>;

/// Runs `f` against the markers. Fails off the coordinator.
pub(crate) fn with_markers<R>(
    markers: &ThreadBound<InitMarkers>,
    f: impl FnOnce(&mut InitMarkers) -> R,
) -> Result<R, QuotaError> {
    let Some(token) = CoordinatorToken::current() else {
        return Err(QuotaError::internal("attempt markers touched off the coordinator"));
    };
    Ok(markers.with(&token, f))
}

/// Removes the slot of an attempt whose leader was cancelled, so later callers retry.
struct LeadGuard<'a, K: Eq + Hash + Clone, V: Clone> {
    markers: &'a ThreadBound<InitMarkers>,
    select: Select<K, V>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LeadGuard<'_, K, V> {
    fn finish(mut self, value: Option<V>) -> Result<(), QuotaError> {
        let Some(key) = self.key.take() else {
            return Ok(());
        };
        let select = self.select;
        with_markers(self.markers, |m| select(m).complete(&key, value))
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for LeadGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take()
            && let Some(token) = CoordinatorToken::current()
        {
            let select = self.select;
            self.markers.with(&token, |m| select(m).complete(&key, None));
        }
    }
}

/// Runs `init` once per key; concurrent callers attach to the attempt in flight.
///
/// Returns the value and whether this call ran the initializer. A failed attempt, or a value
/// rejected by `memoize`, leaves the key uninitialized.
pub(crate) async fn run<K, V, F>(
    markers: &ThreadBound<InitMarkers>,
    select: Select<K, V>,
    key: K,
    memoize: fn(&V) -> bool,
    init: F,
) -> Result<(V, bool), QuotaError>
where
    K: Eq + Hash + Clone,
    V: Clone,
    F: Future<Output = Result<V, QuotaError>>,
{
    match with_markers(markers, |m| select(m).begin(&key))? {
        Begin::Done(value) => Ok((value, false)),
        Begin::Attach(mut rx) => {
            let outcome = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| QuotaError::abort("initialization attempt was abandoned"))?
                .clone();
            match outcome {
                Some(result) => result.map(|value| (value, false)),
                None => Err(QuotaError::internal("initialization finished without an outcome")),
            }
        },
        Begin::Lead(tx) => {
            let guard = LeadGuard { markers, select, key: Some(key) };
            let result = init.await;
            let keep = result.as_ref().ok().filter(|value| memoize(value)).cloned();
            guard.finish(keep)?;
            tx.send_replace(Some(result.clone()));
            result.map(|value| (value, true))
        },
    }
}

pub(crate) const fn always<V>(_: &V) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use qhub_runtime::{Executors, RuntimeConfig};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temporary(m: &mut InitMarkers) -> &mut InitTracker<(), ()> {
        &mut m.temporary
    }

    fn groups(m: &mut InitMarkers) -> &mut InitTracker<String, ()> {
        &mut m.groups
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let executors = Executors::start(&RuntimeConfig::io_pool(1)).expect("executors");
        let markers = Arc::new(ThreadBound::new(InitMarkers::default()));
        let runs = Arc::new(AtomicUsize::new(0));

        let spawn = |markers: Arc<ThreadBound<InitMarkers>>, runs: Arc<AtomicUsize>| {
            executors.coordinate(async move {
                run(&markers, temporary, (), always, async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok(())
                })
                .await
            })
        };
        let a = spawn(Arc::clone(&markers), Arc::clone(&runs));
        let b = spawn(Arc::clone(&markers), Arc::clone(&runs));

        let (_, a_fresh) = a.await.expect("task").expect("init");
        let (_, b_fresh) = b.await.expect("task").expect("init");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(a_fresh ^ b_fresh);

        let again = spawn(Arc::clone(&markers), Arc::clone(&runs)).await.expect("task").expect("init");
        assert!(!again.1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_not_memoized() {
        let executors = Executors::start(&RuntimeConfig::io_pool(1)).expect("executors");
        let markers = Arc::new(ThreadBound::new(InitMarkers::default()));

        let inner = Arc::clone(&markers);
        let failed = executors
            .coordinate(async move {
                run(&inner, groups, "a.com".to_owned(), always, async {
                    Err(QuotaError::abort("disk went away"))
                })
                .await
            })
            .await
            .expect("task");
        assert!(failed.is_err());

        let inner = Arc::clone(&markers);
        let retried = executors
            .coordinate(async move {
                run(&inner, groups, "a.com".to_owned(), always, async { Ok(()) }).await
            })
            .await
            .expect("task");
        assert!(matches!(retried, Ok(((), true))));
    }
}

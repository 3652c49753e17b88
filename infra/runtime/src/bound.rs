use parking_lot::Mutex;
use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static ON_COORDINATOR: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn mark_coordinator_thread() {
    ON_COORDINATOR.with(|flag| flag.set(true));
}

/// Proof that the current code runs on the coordinator thread.
///
/// The token is `!Send`, so it cannot leave the thread it was created on, and it cannot be
/// held across an `.await` inside a task spawned through [`crate::Executors::coordinate`].
#[derive(Debug)]
pub struct CoordinatorToken {
    _not_send: PhantomData<*const ()>,
}

impl CoordinatorToken {
    /// Returns a token if called on the coordinator thread.
    #[must_use]
    pub fn current() -> Option<Self> {
        ON_COORDINATOR.with(Cell::get).then_some(Self { _not_send: PhantomData })
    }
}

/// State owned by the coordinator.
///
/// Contents are reachable only through [`ThreadBound::with`], which requires a
/// [`CoordinatorToken`]. The inner mutex exists to make the wrapper `Sync`; it is never contended
/// because only one thread can present a token.
#[derive(Debug, Default)]
pub struct ThreadBound<T> {
    inner: Mutex<T>,
}

impl<T> ThreadBound<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    /// Runs `f` with exclusive access to the contents.
    pub fn with<R>(&self, _token: &CoordinatorToken, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_unavailable_off_coordinator() {
        assert!(CoordinatorToken::current().is_none());
    }

    #[test]
    fn marked_thread_yields_token() {
        std::thread::spawn(|| {
            mark_coordinator_thread();
            let token = CoordinatorToken::current().expect("marked thread");
            let bound = ThreadBound::new(vec![1, 2]);
            bound.with(&token, |v| v.push(3));
            assert_eq!(bound.into_inner(), vec![1, 2, 3]);
        })
        .join()
        .expect("thread completes");
    }
}

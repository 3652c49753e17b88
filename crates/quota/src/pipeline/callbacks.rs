use bitflags::bitflags;
use tokio::sync::oneshot;

bitflags! {
    /// Which completion signals a caller wants from a storage operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallbackOptions: u8 {
        /// Fired right before the operation releases its directory lock.
        const WILL_FINISH = 1 << 0;
        /// Fired right after the lock was released.
        const DID_FINISH = 1 << 1;
    }
}

/// The sending half, handed to the operation.
#[derive(Debug, Default)]
pub struct OperationCallbacks {
    will_finish: Option<oneshot::Sender<()>>,
    did_finish: Option<oneshot::Sender<()>>,
}

/// The receiving half, kept by the caller.
#[derive(Debug, Default)]
pub struct OperationListeners {
    pub will_finish: Option<oneshot::Receiver<()>>,
    pub did_finish: Option<oneshot::Receiver<()>>,
}

impl OperationCallbacks {
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(options: CallbackOptions) -> (Self, OperationListeners) {
        let mut callbacks = Self::default();
        let mut listeners = OperationListeners::default();
        if options.contains(CallbackOptions::WILL_FINISH) {
            let (tx, rx) = oneshot::channel();
            callbacks.will_finish = Some(tx);
            listeners.will_finish = Some(rx);
        }
        if options.contains(CallbackOptions::DID_FINISH) {
            let (tx, rx) = oneshot::channel();
            callbacks.did_finish = Some(tx);
            listeners.did_finish = Some(rx);
        }
        (callbacks, listeners)
    }

    pub(crate) fn will_finish(&mut self) {
        if let Some(tx) = self.will_finish.take() {
            let _ = tx.send(());
        }
    }

    pub(crate) fn did_finish(&mut self) {
        if let Some(tx) = self.did_finish.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_requested_signals_are_wired() {
        let (mut callbacks, mut listeners) = OperationCallbacks::new(CallbackOptions::DID_FINISH);
        assert!(listeners.will_finish.is_none());

        callbacks.will_finish();
        callbacks.did_finish();
        callbacks.did_finish();
        let did = listeners.did_finish.as_mut().expect("did-finish receiver");
        assert!(did.try_recv().is_ok());
    }
}

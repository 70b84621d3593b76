//! Process-wide cancellation, threaded through constructors rather than
//! kept in module-level state.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable shutdown handle.
///
/// Any clone may [`trigger`](Self::trigger) shutdown; every task holding
/// a clone observes it, either by polling [`is_triggered`](Self::is_triggered)
/// at safe points or by awaiting [`triggered`](Self::triggered) in a
/// `select!` loop.
#[derive(Clone, Debug)]
pub struct Shutdown {
    trigger: Arc<watch::Sender<bool>>,
    signal: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (trigger, signal) = watch::channel(false);
        Self {
            trigger: Arc::new(trigger),
            signal,
        }
    }

    /// Signals every holder of this handle to stop. Idempotent.
    pub fn trigger(&self) {
        // receivers are never all dropped while a trigger exists, but even
        // if they were there is no one left to notify
        let _ = self.trigger.send(true);
    }

    /// Returns true once shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once shutdown is triggered.
    pub async fn triggered(&mut self) {
        if *self.signal.borrow_and_update() {
            return;
        }
        while self.signal.changed().await.is_ok() {
            if *self.signal.borrow_and_update() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

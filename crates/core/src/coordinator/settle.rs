use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// One-shot completion token shared by every branch that may finish an
/// operation. Only the first `settle` is delivered.
pub struct SettleGuard<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> SettleGuard<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Delivers `value` unless the guard has already settled. Returns whether
    /// this call won.
    pub fn settle(&self, value: T) -> bool {
        match self.slot.lock().take() {
            Some(tx) => {
                // A dropped receiver still counts as settled.
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl<T> Clone for SettleGuard<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> std::fmt::Debug for SettleGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettleGuard")
            .field("settled", &self.is_settled())
            .finish()
    }
}

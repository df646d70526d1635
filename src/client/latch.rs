use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A one-way boolean latch with async waiters. Once set it stays set;
/// `wait` resolves immediately afterwards.
pub(crate) struct Latch {
    set: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Sets the latch; returns whether this call was the one to set it.
    pub fn set(&self) -> bool {
        let newly = !self.set.swap(true, Ordering::SeqCst);
        if newly {
            self.notify.notify_waiters();
        }
        newly
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        while !self.is_set() {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a concurrent set() cannot
            // slip between the check and the await.
            notified.as_mut().enable();
            if self.is_set() {
                break;
            }
            notified.await;
        }
    }
}

// Cooperative cancellation handle passed to every public I/O operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A cloneable cancellation flag. Triggering is sticky: once canceled, every
/// current and future waiter observes it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// A token that can never fire, for callers without a cancellation source.
    pub fn none() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[inline(always)]
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Resolves when the token fires. Already-canceled tokens resolve
    /// immediately.
    pub async fn canceled(&self) {
        if self.is_canceled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
            if self.is_canceled() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_for_existing_and_future_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.canceled().await });

        token.cancel();
        task.await.unwrap();

        // Late waiters resolve immediately.
        token.canceled().await;
        assert!(token.is_canceled());
    }
}

//! Single-value rendezvous between two connection handlers
//!
//! A [`Rendezvous`] carries at most one value from whichever side produces
//! it to the side waiting for it. Closing tears the channel down for good:
//! late senders see `false` and the waiter wakes with `None`. Both sides may
//! race close against send; the primitive guarantees at-most-once delivery
//! either way.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, mpsc};
use tokio::sync::Mutex;

/// One-shot, closeable hand-off point for a single value
#[derive(Debug)]
pub struct Rendezvous<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    closed: AtomicBool,
    notify: Notify,
}

impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Rendezvous<T> {
    /// Create an open rendezvous
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Offer a value. Returns `false` if the rendezvous is closed or a value
    /// was already offered.
    pub fn try_send(&self, value: T) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let sent = self.tx.try_send(value).is_ok();
        if sent {
            self.notify.notify_one();
        }
        sent
    }

    /// Close the rendezvous. Idempotent; wakes any pending waiter.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for a value.
    ///
    /// Returns `None` once the rendezvous is closed and no value is pending.
    /// A value offered before the close still wins.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        loop {
            if let Ok(value) = rx.try_recv() {
                return Some(value);
            }
            if self.closed.load(Ordering::Acquire) {
                // One more look: a send may have slipped in before the close
                return rx.try_recv().ok();
            }
            self.notify.notified().await;
        }
    }
}

impl<T> Rendezvous<T> {
    /// Convenience constructor returning a shared handle
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn delivers_single_value() {
        let r = Rendezvous::new();
        assert!(r.try_send(42));
        assert_eq!(r.recv().await, Some(42));
    }

    #[tokio::test]
    async fn second_send_is_rejected() {
        let r = Rendezvous::new();
        assert!(r.try_send(1));
        assert!(!r.try_send(2));
        assert_eq!(r.recv().await, Some(1));
    }

    #[tokio::test]
    async fn close_wakes_waiter_with_none() {
        let r = Rendezvous::<u32>::shared();
        let waiter = {
            let r = Arc::clone(&r);
            tokio::spawn(async move { r.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        r.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let r = Rendezvous::new();
        r.close();
        assert!(!r.try_send(5));
        assert_eq!(r.recv().await, None);
    }

    #[tokio::test]
    async fn value_sent_before_close_still_delivered() {
        let r = Rendezvous::new();
        assert!(r.try_send(7));
        r.close();
        assert_eq!(r.recv().await, Some(7));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let r = Rendezvous::<()>::new();
        r.close();
        r.close();
        assert!(r.is_closed());
    }
}

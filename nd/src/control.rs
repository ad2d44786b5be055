//! Cancellation and pause primitives
//!
//! Every task receives a [`CancelSignal`] and a [`PauseGate`]; in-process
//! tasks check them at batch boundaries, the crawl runner translates them
//! into worker signals. Both are thin wrappers over watch channels so state
//! changes wake waiters immediately.

use tokio::sync::watch;

/// Owner side of a cancel signal
///
/// Held by the orchestrator's active-task handle. Dropping the handle counts
/// as cancellation so an orphaned task cannot keep running unobserved.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observable cancellation flag handed to tasks
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested
    ///
    /// Also resolves when the handle is dropped.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// A signal that never fires, for contexts without an owner
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the signal stays un-cancelled
        std::mem::forget(tx);
        Self { rx }
    }
}

/// Create a linked cancel handle/signal pair
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Owner side of a pause gate
#[derive(Debug)]
pub struct PauseHandle {
    tx: watch::Sender<bool>,
}

impl PauseHandle {
    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Pause flag observed by cooperative tasks at batch boundaries
#[derive(Debug, Clone)]
pub struct PauseGate {
    rx: watch::Receiver<bool>,
}

impl PauseGate {
    pub fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    /// Block while paused; returns immediately when not
    pub async fn wait_if_paused(&mut self) {
        loop {
            if !*self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Create a linked pause handle/gate pair
pub fn pause_pair() -> (PauseHandle, PauseGate) {
    let (tx, rx) = watch::channel(false);
    (PauseHandle { tx }, PauseGate { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_observed() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());

        handle.cancel();
        assert!(signal.is_cancelled());

        // Idempotent
        handle.cancel();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let (handle, mut signal) = cancel_pair();

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels() {
        let (handle, mut signal) = cancel_pair();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("drop should wake the waiter");
    }

    #[tokio::test]
    async fn test_never_signal() {
        let signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_pause_round_trip() {
        let (handle, mut gate) = pause_pair();
        assert!(!gate.is_paused());

        // Not paused: returns immediately
        gate.wait_if_paused().await;

        handle.pause();
        assert!(gate.is_paused());

        let mut gate2 = gate.clone();
        let waiter = tokio::spawn(async move {
            gate2.wait_if_paused().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.resume();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("resume should unblock")
            .unwrap();
    }
}

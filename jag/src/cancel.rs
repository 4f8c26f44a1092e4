//! Cancellation signal for scans and background tasks.
//!
//! The owner keeps a [`CancelHandle`]; tasks hold [`Cancel`] clones. When
//! the handle is dropped (or [`CancelHandle::cancel`] is called) every
//! clone observes cancellation, so a background task never outlives the
//! connection that started it.

use tokio::sync::watch;

/// Owner side of a cancellation signal. Cancels on drop.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

/// Task side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct Cancel(watch::Receiver<bool>);

/// Creates a linked handle/signal pair.
pub fn pair() -> (CancelHandle, Cancel) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), Cancel(rx))
}

impl CancelHandle {
    /// Signals cancellation to every [`Cancel`] clone.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Returns another signal linked to this handle.
    pub fn signal(&self) -> Cancel {
        Cancel(self.0.subscribe())
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Cancel {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel never closes.
        std::mem::forget(tx);
        Self(rx)
    }

    /// Returns `true` if cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once cancellation is signalled.
    pub async fn cancelled(&mut self) {
        // A closed channel means the handle is gone, which also cancels.
        let _ = self.0.wait_for(|c| *c).await;
    }
}

//! Process-wide cancellation signal.
//!
//! A [`ShutdownTrigger`] flips the signal once; any number of cloned
//! [`Shutdown`] handles observe it, either by polling [`Shutdown::is_triggered`]
//! at loop boundaries or by racing [`Shutdown::triggered`] against I/O in a
//! `tokio::select!`.

use thiserror::Error;
use tokio::sync::watch;

/// Returned by work that stopped because the signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled by shutdown")]
pub struct Cancelled;

/// Sending half. Dropping it without calling [`trigger`](Self::trigger) never
/// cancels anything.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Creates a connected trigger/handle pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace succeeds even when every receiver is gone
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    /// A handle that is never triggered.
    pub fn never() -> Self {
        channel().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires. Pends forever if the trigger was
    /// dropped without firing.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

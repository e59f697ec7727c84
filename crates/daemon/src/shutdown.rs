//! Cooperative shutdown signal shared across the pipeline.
//!
//! A single trigger fans out to every component that must stop accepting
//! work or cancel an in-flight external call. Receivers observe the signal
//! either by polling [`Shutdown::is_cancelled`] or by awaiting
//! [`Shutdown::cancelled`] inside a `select!`.

use tokio::sync::watch;

/// Create a connected trigger/receiver pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Requests shutdown. Held by the orchestrator; firing is idempotent.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // Receivers only care about the transition to true.
        let _ = self.tx.send(true);
    }
}

/// Cheap-to-clone view of the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// True once shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested.
    ///
    /// A dropped trigger counts as shutdown, so tasks never wait forever on
    /// a signal that can no longer fire.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

//! Single shared cancellation signal
//!
//! One [`ShutdownTrigger`] owned by the service, any number of
//! [`ShutdownSignal`] clones observed by the loops and by retry backoffs.

use tokio::sync::watch;

/// Fires the signal once; every clone of the paired signal observes it
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cheap to clone, awaitable
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires (or is dropped)
    pub async fn triggered(&mut self) {
        // wait_for errors only when the sender is gone, which also means shutdown
        let _ = self.rx.wait_for(|fired| *fired).await;
    }
}

// Process shutdown signalling shared by workers, heartbeats and sweepers

use std::sync::Arc;
use tokio::sync::watch;

/// Fires the shutdown signal. Firing more than once is a no-op.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes the shutdown signal. Cheap to clone; every clone sees the same signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    /// Fire the signal; returns true only for the call that actually fired it
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new observer of this trigger
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    ///
    /// Also resolves if every trigger has been dropped, since nothing can
    /// fire the signal any more.
    pub async fn cancelled(&mut self) {
        // wait_for returns Err only when the sender is gone
        let _ = self.rx.wait_for(|fired| *fired).await;
    }
}

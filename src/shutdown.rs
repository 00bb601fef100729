//! Cooperative cancellation for long-running resolves and installs
//!
//! A [`ShutdownHandle`] is held by whoever decides to stop (the interrupt
//! handler in the binary); every in-flight fetch races its work against
//! [`Shutdown::recv`] and gives up with a `Cancelled` error once signalled.

use tokio::sync::watch;

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Listens to the signal sent by the corresponding [`ShutdownHandle`]
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/listener pair
pub fn channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

impl ShutdownHandle {
    pub fn signal(&self) {
        // No listeners left means nothing is running
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    /// A listener that is never signalled
    pub fn never() -> Self {
        let (_, shutdown) = channel();
        shutdown
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been signalled
    pub async fn recv(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without signalling
                std::future::pending::<()>().await;
            }
        }
    }
}

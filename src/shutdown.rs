use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Fires the shutdown signal observed by every [`Shutdown`] clone.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cancellation signal honored at every blocking point of the workers.
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered (or the trigger dropped).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err means the trigger is gone, which is as final as a shutdown
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration`. Returns false if shutdown interrupted the sleep.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Blocking variant of [`Shutdown::sleep`] for threads outside the runtime.
    pub fn sleep_blocking(&self, handle: &Handle, duration: Duration) -> bool {
        handle.block_on(self.sleep(duration))
    }
}

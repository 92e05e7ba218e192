//! Cooperative cancellation shared by every worker.

use tokio::sync::watch;
use tracing::{info, warn};

/// Fires the cancellation signal.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Observes the cancellation signal. Cheap to clone into tasks.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without triggering: nothing can fire any more.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// First Ctrl+C cancels gracefully. Second Ctrl+C exits immediately.
pub fn setup_shutdown_handler(trigger: ShutdownTrigger) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, finishing in-flight work and writing a checkpoint");
            info!("Press Ctrl+C again to force quit");
            trigger.trigger();

            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Force quit requested, exiting immediately");
                std::process::exit(130);
            }
        }
    })
}

//! hoster-workers — the periodic reconcilers.
//!
//! Four workers share one lifecycle contract: `start()` spawns the run
//! loop and returns a handle; `stop()` signals a watch channel and
//! joins the loop. A worker never begins a new cycle before the
//! previous cycle's tasks have returned.

pub mod billing;
pub mod dns;
pub mod health;
pub mod provisioner;

pub use billing::{BillingReporter, BillingSink, HttpBillingSink, NoopBillingSink};
pub use dns::DnsVerifier;
pub use health::HealthChecker;
pub use provisioner::Provisioner;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Handle to a running worker. Dropping it without `stop` leaves the
/// worker running until the process exits.
pub struct WorkerHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        name: &'static str,
        shutdown_tx: watch::Sender<bool>,
        handle: JoinHandle<()>,
    ) -> Self {
        Self { name, shutdown_tx, handle: Some(handle) }
    }

    /// Signal cancel and wait for the run loop to exit. Idempotent.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            info!(worker = self.name, "worker stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                    _ = rx.changed() => break,
                }
            }
        });

        let mut worker = WorkerHandle::new("test", tx, handle);
        worker.stop().await;
        // Second stop does nothing and does not hang.
        worker.stop().await;
    }
}

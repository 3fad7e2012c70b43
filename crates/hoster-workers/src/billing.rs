//! Billing reporter.
//!
//! Drains the usage-event outbox in timestamp order: fetch a batch of
//! unreported events, POST them upstream as a JSON:API document, and
//! stamp `reported_at` on success. Failed batches stay unreported and
//! retry unchanged next tick, so the reporter is resumable and never
//! reorders.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use hoster_store::{Store, UsageEvent};

use crate::WorkerHandle;

/// Where reported batches go.
#[async_trait]
pub trait BillingSink: Send + Sync {
    /// Deliver a batch; an error leaves the batch unreported.
    async fn report(&self, events: &[UsageEvent]) -> Result<(), String>;
}

/// POSTs batches to the upstream billing service.
pub struct HttpBillingSink {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpBillingSink {
    pub fn new(endpoint: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            token,
        }
    }
}

/// Render a batch as a JSON:API document.
pub fn jsonapi_document(events: &[UsageEvent]) -> serde_json::Value {
    serde_json::json!({
        "data": events
            .iter()
            .map(|e| serde_json::json!({
                "type": "usage-events",
                "id": e.reference_id,
                "attributes": {
                    "user_id": e.user_id,
                    "event_type": e.event_type,
                    "resource_id": e.resource_id,
                    "resource_type": e.resource_type,
                    "quantity": e.quantity,
                    "metadata": e.metadata,
                    "timestamp": e.timestamp.to_rfc3339(),
                },
            }))
            .collect::<Vec<_>>(),
    })
}

#[async_trait]
impl BillingSink for HttpBillingSink {
    async fn report(&self, events: &[UsageEvent]) -> Result<(), String> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/vnd.api+json")
            .json(&jsonapi_document(events));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("billing endpoint returned {}", response.status()));
        }
        Ok(())
    }
}

/// Accepts batches without delivering them anywhere. Substituted when
/// no billing endpoint is configured; events still get stamped so the
/// outbox stays bounded.
pub struct NoopBillingSink;

#[async_trait]
impl BillingSink for NoopBillingSink {
    async fn report(&self, _events: &[UsageEvent]) -> Result<(), String> {
        Ok(())
    }
}

/// Periodic outbox drainer.
pub struct BillingReporter {
    store: Store,
    sink: Arc<dyn BillingSink>,
    interval: Duration,
    batch_size: usize,
}

impl BillingReporter {
    pub fn new(
        store: Store,
        sink: Arc<dyn BillingSink>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self { store, sink, interval, batch_size }
    }

    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => { self.tick().await; }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        WorkerHandle::new("billing-reporter", shutdown_tx, handle)
    }

    /// One cycle: report at most one batch.
    pub async fn tick(&self) {
        let events = match self.store.get_unreported_events(self.batch_size).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "fetching outbox failed");
                return;
            }
        };
        if events.is_empty() {
            return;
        }
        debug!(count = events.len(), "reporting usage events");

        match self.sink.report(&events).await {
            Ok(()) => {
                let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
                if let Err(e) = self.store.mark_events_reported(&ids, Utc::now()).await {
                    // Next tick re-reports the same batch; the upstream
                    // dedupes by event id.
                    warn!(error = %e, "marking events reported failed");
                    return;
                }
                info!(count = ids.len(), "usage events reported");
            }
            Err(e) => {
                warn!(error = %e, "billing report failed, batch retries next tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use hoster_store::store::NewUsageEvent;

    #[derive(Default)]
    struct MockSink {
        batches: Mutex<Vec<Vec<String>>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl BillingSink for MockSink {
        async fn report(&self, events: &[UsageEvent]) -> Result<(), String> {
            if *self.fail.lock().unwrap() {
                return Err("upstream 502".to_string());
            }
            self.batches
                .lock()
                .unwrap()
                .push(events.iter().map(|e| e.resource_id.clone()).collect());
            Ok(())
        }
    }

    async fn seed_events(store: &Store, names: &[&str]) {
        for name in names {
            store
                .record_usage_event(NewUsageEvent {
                    user_id: "user-1".to_string(),
                    event_type: "deployment.started".to_string(),
                    resource_id: name.to_string(),
                    resource_type: "deployment".to_string(),
                    quantity: 1,
                    metadata: HashMap::new(),
                })
                .await
                .unwrap();
        }
    }

    fn reporter(store: Store, sink: Arc<MockSink>) -> BillingReporter {
        BillingReporter::new(store, sink, Duration::from_secs(60), 100)
    }

    #[tokio::test]
    async fn batch_reports_in_timestamp_order_then_drains() {
        let store = Store::open_in_memory().await.unwrap();
        seed_events(&store, &["t1", "t2", "t3"]).await;
        let sink = Arc::new(MockSink::default());
        let reporter = reporter(store.clone(), sink.clone());

        reporter.tick().await;
        assert_eq!(
            *sink.batches.lock().unwrap(),
            vec![vec!["t1".to_string(), "t2".to_string(), "t3".to_string()]]
        );

        // Second cycle finds no work.
        reporter.tick().await;
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_batch_retries_with_same_order() {
        let store = Store::open_in_memory().await.unwrap();
        seed_events(&store, &["t1", "t2", "t3"]).await;
        let sink = Arc::new(MockSink::default());
        *sink.fail.lock().unwrap() = true;
        let reporter = reporter(store.clone(), sink.clone());

        reporter.tick().await;
        assert!(sink.batches.lock().unwrap().is_empty());
        assert_eq!(store.get_unreported_events(10).await.unwrap().len(), 3);

        *sink.fail.lock().unwrap() = false;
        reporter.tick().await;
        assert_eq!(
            *sink.batches.lock().unwrap(),
            vec![vec!["t1".to_string(), "t2".to_string(), "t3".to_string()]]
        );
        assert!(store.get_unreported_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_size_limits_each_cycle() {
        let store = Store::open_in_memory().await.unwrap();
        seed_events(&store, &["a", "b", "c"]).await;
        let sink = Arc::new(MockSink::default());
        let reporter = BillingReporter::new(store.clone(), sink.clone(), Duration::from_secs(60), 2);

        reporter.tick().await;
        reporter.tick().await;
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(batches[1], vec!["c".to_string()]);
    }

    #[test]
    fn jsonapi_document_shape() {
        let event = UsageEvent {
            id: 1,
            reference_id: "evt_1".to_string(),
            user_id: "user-1".to_string(),
            event_type: "deployment.started".to_string(),
            resource_id: "dep_1".to_string(),
            resource_type: "deployment".to_string(),
            quantity: 1,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            reported_at: None,
        };
        let doc = jsonapi_document(&[event]);
        assert_eq!(doc["data"][0]["type"], "usage-events");
        assert_eq!(doc["data"][0]["id"], "evt_1");
        assert_eq!(doc["data"][0]["attributes"]["event_type"], "deployment.started");
    }
}

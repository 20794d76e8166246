//! Webhook subscriptions and delivery (§4.5).
//!
//! Delivery attempts run as named tasks on
//! [`crate::agents::BackgroundWorker`], one task per delivery attempt so a
//! stuck POST never blocks the dispatcher loop. Retries reuse the same
//! `tokio::time::sleep` backoff shape as the pool's reconnect loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::agents::BackgroundWorkerAgent;
use crate::events::{EventBus, EventEnvelope, EventFilter};
use crate::storage::GatewayStorage;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// A registered webhook target (§4.5: "subscriptions filter by event kind
/// and optionally by server id").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    pub secret: Option<String>,
    pub filter: EventFilter,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub enabled: bool,
}

/// A single delivery attempt record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_id: Uuid,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_response_status: Option<u16>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    fn new(subscription_id: Uuid, event_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            subscription_id,
            event_id,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_response_status: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Matches incoming events against subscriptions and drives delivery
/// attempts through the background worker.
pub struct WebhookDispatcher {
    subscriptions: DashMap<Uuid, WebhookSubscription>,
    worker: Arc<BackgroundWorkerAgent>,
    storage: Arc<dyn GatewayStorage>,
    http: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(worker: Arc<BackgroundWorkerAgent>, storage: Arc<dyn GatewayStorage>) -> Self {
        Self {
            subscriptions: DashMap::new(),
            worker,
            storage,
            http: reqwest::Client::new(),
        }
    }

    /// Load every subscription persisted by a prior run (§3:
    /// "admin-managed" implies surviving a restart), meant to be called
    /// once at boot before [`Self::run`].
    pub async fn load_subscriptions(&self) -> anyhow::Result<()> {
        for subscription in self.storage.list_webhook_subscriptions().await? {
            self.subscriptions.insert(subscription.id, subscription);
        }
        Ok(())
    }

    pub async fn upsert_subscription(&self, subscription: WebhookSubscription) -> anyhow::Result<()> {
        self.storage.put_webhook_subscription(subscription.clone()).await?;
        self.subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    pub async fn remove_subscription(&self, id: Uuid) -> anyhow::Result<()> {
        self.storage.delete_webhook_subscription(id).await?;
        self.subscriptions.remove(&id);
        Ok(())
    }

    pub fn get_subscription(&self, id: Uuid) -> Option<WebhookSubscription> {
        self.subscriptions.get(&id).map(|kv| kv.value().clone())
    }

    pub fn list_subscriptions(&self) -> Vec<WebhookSubscription> {
        self.subscriptions.iter().map(|kv| kv.value().clone()).collect()
    }

    pub async fn list_deliveries(&self, subscription_id: Uuid) -> anyhow::Result<Vec<WebhookDelivery>> {
        Ok(self.storage.list_webhook_deliveries(subscription_id).await?)
    }

    /// Spawn a background task that drains `events` and dispatches
    /// matching deliveries. Intended to run for the lifetime of the
    /// gateway.
    pub fn run(self: Arc<Self>, events: Arc<EventBus>) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut rx = events.subscribe();
            loop {
                match rx.recv().await {
                    Ok(envelope) => dispatcher.dispatch(envelope).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn dispatch(&self, envelope: EventEnvelope) {
        let matches: Vec<WebhookSubscription> = self
            .subscriptions
            .iter()
            .filter(|kv| kv.enabled && kv.filter.matches(&envelope))
            .map(|kv| kv.value().clone())
            .collect();

        for subscription in matches {
            let delivery = WebhookDelivery::new(subscription.id, envelope.id);
            self.storage.put_webhook_delivery(delivery.clone()).await.ok();
            self.schedule_attempt(subscription, envelope.clone(), delivery).await;
        }
    }

    async fn schedule_attempt(&self, subscription: WebhookSubscription, envelope: EventEnvelope, delivery: WebhookDelivery) {
        let http = self.http.clone();
        let storage = self.storage.clone();
        let task_id = format!("webhook-delivery-{}", delivery.id);

        self.worker
            .submit(task_id, move || async move {
                let mut delivery = delivery;
                let body = serde_json::to_vec(&envelope).unwrap_or_default();

                loop {
                    delivery.attempts += 1;
                    delivery.updated_at = Utc::now();

                    let mut request = http.post(&subscription.url).header("content-type", "application/json");
                    if let Some(secret) = &subscription.secret {
                        if let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) {
                            mac.update(&body);
                            let signature = mac.finalize().into_bytes();
                            let hex_signature: String = signature.iter().map(|b| format!("{:02x}", b)).collect();
                            request = request.header("X-Webhook-Signature", format!("sha256={hex_signature}"));
                        }
                    }

                    let outcome = request.body(body.clone()).send().await;
                    match outcome {
                        Ok(response) if response.status().is_success() => {
                            delivery.status = DeliveryStatus::Delivered;
                            delivery.last_response_status = Some(response.status().as_u16());
                            let _ = storage.put_webhook_delivery(delivery.clone()).await;
                            return Ok(());
                        }
                        Ok(response) => {
                            delivery.last_response_status = Some(response.status().as_u16());
                            delivery.last_error = Some(format!("non-2xx status {}", response.status()));
                        }
                        Err(e) => {
                            delivery.last_error = Some(e.to_string());
                        }
                    }

                    if delivery.attempts > subscription.retry_count {
                        delivery.status = DeliveryStatus::Failed;
                        let _ = storage.put_webhook_delivery(delivery.clone()).await;
                        return Ok(());
                    }

                    let _ = storage.put_webhook_delivery(delivery.clone()).await;
                    let backoff_ms = subscription.retry_delay_ms.saturating_mul(1u64 << (delivery.attempts - 1).min(20));
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                }
            })
            .await;
    }

    /// Prune deliveries older than `keep_days`, per §4.5's periodic
    /// cleanup requirement.
    pub async fn prune_old_deliveries(&self, keep_days: i64) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(keep_days);
        self.storage.prune_webhook_deliveries_before(cutoff).await
    }
}

/// Config seed for reconciling subscriptions at boot, mirroring
/// [`crate::pool::ServerConfig`]'s role for the connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscriptionSeed {
    pub url: String,
    pub secret: Option<String>,
    pub kinds: Vec<String>,
    pub server_ids: Vec<Uuid>,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl WebhookSubscriptionSeed {
    pub fn into_subscription(self, id: Uuid) -> WebhookSubscription {
        WebhookSubscription {
            id,
            url: self.url,
            secret: self.secret,
            filter: EventFilter {
                kinds: (!self.kinds.is_empty()).then_some(self.kinds),
                server_ids: (!self.server_ids.is_empty()).then_some(self.server_ids),
            },
            retry_count: self.retry_count,
            retry_delay_ms: self.retry_delay_ms,
            enabled: true,
        }
    }
}

#[allow(dead_code)]
fn _assert_seed_map_shape(_: HashMap<String, String>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GatewayEvent;

    #[test]
    fn backoff_doubles_each_attempt() {
        let base: u64 = 1000;
        let attempt1 = base.saturating_mul(1u64 << (1u32 - 1).min(20));
        let attempt2 = base.saturating_mul(1u64 << (2u32 - 1).min(20));
        let attempt3 = base.saturating_mul(1u64 << (3u32 - 1).min(20));
        assert_eq!(attempt1, 1000);
        assert_eq!(attempt2, 2000);
        assert_eq!(attempt3, 4000);
    }

    #[test]
    fn seed_with_empty_filters_becomes_none() {
        let seed = WebhookSubscriptionSeed {
            url: "https://example.com/hook".into(),
            secret: None,
            kinds: Vec::new(),
            server_ids: Vec::new(),
            retry_count: 3,
            retry_delay_ms: 500,
        };
        let subscription = seed.into_subscription(Uuid::now_v7());
        assert!(subscription.filter.kinds.is_none());
        assert!(subscription.filter.server_ids.is_none());
    }

    #[test]
    fn filter_matches_delegates_correctly() {
        let server_id = Uuid::now_v7();
        let seed = WebhookSubscriptionSeed {
            url: "https://example.com/hook".into(),
            secret: None,
            kinds: vec!["server.connected".into()],
            server_ids: vec![server_id],
            retry_count: 3,
            retry_delay_ms: 500,
        };
        let subscription = seed.into_subscription(Uuid::now_v7());
        let envelope = EventEnvelope {
            id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            event: GatewayEvent::ServerConnected { server_id },
        };
        assert!(subscription.filter.matches(&envelope));
    }
}

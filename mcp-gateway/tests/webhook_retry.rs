//! End-to-end scenario 6 (§8): a webhook subscription whose target fails
//! twice and then succeeds ends up `Delivered` with `attempts == 3`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcp_gateway::events::webhooks::{DeliveryStatus, WebhookDispatcher, WebhookSubscription};
use mcp_gateway::events::{EventBus, EventFilter, GatewayEvent};
use mcp_gateway::prelude::*;
use mcp_gateway::storage::InMemoryGatewayStorage;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Responds 500 to the first two requests it sees, then 200 to every
/// request after that — deterministic regardless of wiremock's mock
/// matching/priority order, since only one mock is ever registered.
struct FailTwiceThenSucceed {
    calls: AtomicU32,
}

impl Respond for FailTwiceThenSucceed {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            ResponseTemplate::new(500)
        } else {
            ResponseTemplate::new(200)
        }
    }
}

#[tokio::test]
async fn subscription_recovers_after_two_failures_and_is_marked_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(FailTwiceThenSucceed { calls: AtomicU32::new(0) })
        .expect(3)
        .mount(&server)
        .await;

    let mut runtime = ActonApp::launch();
    let worker = Arc::new(BackgroundWorkerAgent::spawn(&mut runtime).await.unwrap());
    let storage: Arc<dyn GatewayStorage> = Arc::new(InMemoryGatewayStorage::new());
    let events = Arc::new(EventBus::new(16));

    let dispatcher = Arc::new(WebhookDispatcher::new(worker, storage));
    let subscription = WebhookSubscription {
        id: Uuid::now_v7(),
        url: format!("{}/hook", server.uri()),
        secret: None,
        filter: EventFilter { kinds: Some(vec!["server.connected".into()]), server_ids: None },
        retry_count: 2,
        retry_delay_ms: 10,
        enabled: true,
    };
    dispatcher.upsert_subscription(subscription.clone()).await.unwrap();
    dispatcher.clone().run(events.clone());

    events.publish(GatewayEvent::ServerConnected { server_id: Uuid::now_v7() });

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let deliveries = dispatcher.list_deliveries(subscription.id).await.unwrap();
            if let Some(delivery) = deliveries.into_iter().find(|d| d.status != DeliveryStatus::Pending) {
                return delivery;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("delivery did not reach a terminal state in time");

    assert_eq!(delivered.status, DeliveryStatus::Delivered);
    assert_eq!(delivered.attempts, 3);
    assert_eq!(delivered.last_response_status, Some(200));

    runtime.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn subscription_is_marked_failed_after_exhausting_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path("/hook")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

    let mut runtime = ActonApp::launch();
    let worker = Arc::new(BackgroundWorkerAgent::spawn(&mut runtime).await.unwrap());
    let storage: Arc<dyn GatewayStorage> = Arc::new(InMemoryGatewayStorage::new());
    let events = Arc::new(EventBus::new(16));

    let dispatcher = Arc::new(WebhookDispatcher::new(worker, storage));
    let subscription = WebhookSubscription {
        id: Uuid::now_v7(),
        url: format!("{}/hook", server.uri()),
        secret: None,
        filter: EventFilter { kinds: None, server_ids: None },
        retry_count: 1,
        retry_delay_ms: 10,
        enabled: true,
    };
    dispatcher.upsert_subscription(subscription.clone()).await.unwrap();
    dispatcher.clone().run(events.clone());

    events.publish(GatewayEvent::ServerConnected { server_id: Uuid::now_v7() });

    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let deliveries = dispatcher.list_deliveries(subscription.id).await.unwrap();
            if let Some(delivery) = deliveries.into_iter().find(|d| d.status == DeliveryStatus::Failed) {
                return delivery;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("delivery did not reach `failed` in time");

    // retry_count=1 allows attempts 1 (initial) + 1 (retry) = 2 before giving up.
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.last_response_status, Some(500));

    runtime.shutdown_all().await.unwrap();
}

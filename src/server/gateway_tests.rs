// End-to-end tests: publish with the broker down, then redeliver

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::engine::outcome::tests::RecordingRecorder;
use crate::engine::outcome::{RetryPolicy, StoreOutcomeRecorder};
use crate::engine::producer::tests::{FakeFactory, FakeProducer};
use crate::engine::storage::{CompensationStore, InMemoryCompensationStore, InMemoryConfigResolver};
use crate::models::{
    AppConfig, CallbackConfig, CompensateSource, CompensateStatus, Message, MessageCompensate,
    MessageConfig, TransportType,
};
use crate::server::gateway::{Gateway, GatewayBuilder};
use crate::settings::GatewayConfig;
use crate::{DeliveryOutcome, MessageBusError, PublishReceipt};

struct Scenario {
    gateway: Gateway,
    producer: Arc<FakeProducer>,
    store: Arc<InMemoryCompensationStore>,
    recorder: Arc<RecordingRecorder>,
    _ok: MockServer,
    _failing: MockServer,
}

async fn scenario() -> Scenario {
    let ok = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&ok)
        .await;
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200).set_body_string("retry later"))
        .mount(&failing)
        .await;

    let app = AppConfig::new("trading", TransportType::Nats).with_message_config(
        MessageConfig::new("order_paid")
            .with_callback(CallbackConfig::new("a", format!("{}/a", ok.uri())))
            .with_callback(CallbackConfig::new("b", format!("{}/b", failing.uri()))),
    );

    let mut config = GatewayConfig::default();
    config.nats.enabled = false;

    let producer = Arc::new(FakeProducer::healthy());
    let store = Arc::new(InMemoryCompensationStore::new());
    let recorder = Arc::new(RecordingRecorder::forwarding(Arc::new(
        StoreOutcomeRecorder::new(store.clone(), RetryPolicy::from(&config.worker), 1000),
    )));

    let gateway = GatewayBuilder::new(config)
        .with_config_resolver(Arc::new(InMemoryConfigResolver::new().with_app(app)))
        .with_compensation_store(store.clone())
        .with_producer_factory(Arc::new(FakeFactory::new(producer.clone())))
        .with_recorder(recorder.clone())
        .build()
        .await
        .unwrap();

    Scenario {
        gateway,
        producer,
        store,
        recorder,
        _ok: ok,
        _failing: failing,
    }
}

/// Wait until background publishing has written `count` records
async fn wait_for_records(store: &InMemoryCompensationStore, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_broker_down_then_partial_redelivery() {
    let scenario = scenario().await;
    scenario.producer.healthy.store(false, Ordering::SeqCst);

    let message = Message::new("trading", "order_paid", "order-1", "{\"orderId\":1}");
    let uuid = message.uuid.clone();
    let receipt = scenario.gateway.publish(message).await.unwrap();
    assert_eq!(receipt, PublishReceipt::Async);

    wait_for_records(&scenario.store, 2).await;
    let records = scenario.store.records().unwrap();
    assert!(records.iter().all(|r| r.source == CompensateSource::Publish));

    let report = scenario.gateway.worker().drain_once().await.unwrap();
    assert_eq!(report.due, 2);
    assert_eq!(scenario.recorder.successes(), 1);
    assert_eq!(scenario.recorder.failures(), 1);

    let a = scenario
        .store
        .get(&MessageCompensate::record_id(&uuid, "a"))
        .await
        .unwrap()
        .unwrap();
    let b = scenario
        .store
        .get(&MessageCompensate::record_id(&uuid, "b"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.status, CompensateStatus::Succeeded);
    assert_eq!(b.status, CompensateStatus::Pending);
    assert_eq!(b.last_response.as_deref(), Some("retry later"));

    assert_eq!(scenario.gateway.semaphores().available("a"), Some(20));
    assert_eq!(scenario.gateway.semaphores().available("b"), Some(20));

    scenario.gateway.shutdown().await;
}

#[tokio::test]
async fn test_direct_callback_failure_becomes_compensation() {
    let scenario = scenario().await;

    let message = Message::new("trading", "order_paid", "order-1", "{}");
    let handles = scenario.gateway.dispatch_callbacks(message).await.unwrap();
    assert_eq!(handles.len(), 2);

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.outcome().await);
    }
    assert_eq!(outcomes[0], DeliveryOutcome::Succeeded);
    assert_eq!(outcomes[1], DeliveryOutcome::FailedResponse { status: 200 });

    let records = scenario.store.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].callback_key, "b");
    assert_eq!(records[0].source, CompensateSource::Callback);

    scenario.gateway.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_callbacks_rejects_unknown_code() {
    let scenario = scenario().await;
    let result = scenario
        .gateway
        .dispatch_callbacks(Message::new("trading", "order_refunded", "order-1", "{}"))
        .await;
    assert!(matches!(result, Err(MessageBusError::InvalidArgument(_))));
    scenario.gateway.shutdown().await;
}

#[tokio::test]
async fn test_nats_disabled_requires_factory() {
    let mut config = GatewayConfig::default();
    config.nats.enabled = false;

    let result = Gateway::builder(config).build().await;
    assert!(matches!(result, Err(MessageBusError::Config(_))));
}

#[tokio::test]
async fn test_worker_starts_once_and_stops_on_shutdown() {
    let scenario = scenario().await;
    scenario.gateway.start_worker();
    scenario.gateway.start_worker();

    tokio::time::timeout(Duration::from_secs(2), scenario.gateway.shutdown())
        .await
        .unwrap();
}

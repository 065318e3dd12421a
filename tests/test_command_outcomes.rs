//! Command results and the events they leave on the bus

use mqtt_bridge::bridge::EventStream;
use mqtt_bridge::engine::reason;
use mqtt_bridge::testing::{MockBehavior, MockEngineFactory};
use mqtt_bridge::{
    BridgeError, BridgeEvent, ClientReference, EngineError, EventKind, Protocol, PublishOptions,
    QoS, SessionConfig, SessionRegistry, Subscription,
};
use std::sync::Arc;
use std::time::Duration;

fn config() -> SessionConfig {
    SessionConfig::builder()
        .address("test.broker", 1883, Protocol::Tcp)
        .unwrap()
        .build()
        .unwrap()
}

async fn open(behavior: MockBehavior) -> (Arc<SessionRegistry>, Arc<MockEngineFactory>, ClientReference) {
    let factory = Arc::new(MockEngineFactory::new(behavior));
    let registry = Arc::new(SessionRegistry::new(factory.clone()));
    let reference = registry.create(config()).await.unwrap();
    (registry, factory, reference)
}

fn drain(events: &mut EventStream) -> Vec<BridgeEvent> {
    std::iter::from_fn(|| events.try_next()).collect()
}

fn subscriptions(topics: &[&str]) -> Vec<Subscription> {
    topics
        .iter()
        .map(|topic| Subscription::new(*topic, QoS::AtLeastOnce))
        .collect()
}

fn subscribed_topics(events: &[BridgeEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            BridgeEvent::Subscribed { topic, .. } => Some(topic.clone()),
            _ => None,
        })
        .collect()
}

fn exceptions(events: &[BridgeEvent]) -> Vec<(i32, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            BridgeEvent::Exception { error, .. } => {
                Some((error.error_code, error.error_message.clone()))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_subscribe_all_granted() {
    let (registry, _, reference) = open(MockBehavior::default()).await;
    let mut events = registry.event_bus().subscribe();

    let result = registry
        .subscribe(&reference, &subscriptions(&["a", "b", "c"]))
        .await;

    assert!(matches!(result, Ok(Some(()))));
    let received = drain(&mut events);
    assert_eq!(subscribed_topics(&received), vec!["a", "b", "c"]);
    assert!(exceptions(&received).is_empty());
}

#[tokio::test]
async fn test_subscribe_partial_failure_still_succeeds() {
    let (registry, _, reference) = open(MockBehavior {
        refused_topics: vec!["b".to_string()],
        ..Default::default()
    })
    .await;
    let mut events = registry.event_bus().subscribe();

    let result = registry
        .subscribe(&reference, &subscriptions(&["a", "b", "c"]))
        .await;

    assert!(matches!(result, Ok(Some(()))));
    let received = drain(&mut events);
    assert_eq!(subscribed_topics(&received), vec!["a", "c"]);
    assert_eq!(
        exceptions(&received),
        vec![(
            reason::SUBSCRIBE_FAILED,
            "Failed to subscribe to topics: b".to_string()
        )]
    );
}

#[tokio::test]
async fn test_subscribe_total_failure_fails() {
    let (registry, _, reference) = open(MockBehavior {
        refused_topics: vec!["a".to_string(), "b".to_string()],
        ..Default::default()
    })
    .await;
    let mut events = registry.event_bus().subscribe();

    let error = registry
        .subscribe(&reference, &subscriptions(&["a", "b"]))
        .await
        .unwrap_err();

    match error {
        BridgeError::OperationFailed { message, .. } => {
            assert_eq!(message, "Failed to subscribe to topics: a, b");
        }
        other => panic!("unexpected error {other:?}"),
    }
    let received = drain(&mut events);
    assert!(subscribed_topics(&received).is_empty());
    assert_eq!(exceptions(&received).len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_exact_confirmation_succeeds() {
    let (registry, factory, reference) = open(MockBehavior::default()).await;
    let mut events = registry.event_bus().subscribe();

    let topics = vec!["a".to_string(), "b".to_string()];
    assert!(matches!(
        registry.unsubscribe(&reference, &topics).await,
        Ok(Some(()))
    ));

    let unsubscribed: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            BridgeEvent::Unsubscribed { topic, .. } => Some(topic),
            _ => None,
        })
        .collect();
    assert_eq!(unsubscribed, topics);
    assert_eq!(
        factory.last_engine().unwrap().get_unsubscribed().await,
        topics
    );
}

#[tokio::test]
async fn test_unsubscribe_proper_subset_fails_naming_missing() {
    let (registry, _, reference) = open(MockBehavior {
        unconfirmed_topics: vec!["b".to_string()],
        ..Default::default()
    })
    .await;

    let error = registry
        .unsubscribe(&reference, &["a".to_string(), "b".to_string()])
        .await
        .unwrap_err();

    match error {
        BridgeError::OperationFailed { message, .. } => {
            assert_eq!(message, "Failed to unsubscribe from topics: b");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_failure_is_result_and_event() {
    let (registry, _, reference) = open(MockBehavior {
        publish_error: Some(EngineError::new(reason::CLIENT_EXCEPTION, "Too many publishes in progress")),
        ..Default::default()
    })
    .await;
    let mut events = registry.event_bus().subscribe();

    let result = registry
        .publish(&reference, "a/b", "x".into(), PublishOptions::default())
        .await;

    assert!(matches!(result, Err(BridgeError::OperationFailed { .. })));
    let received = drain(&mut events);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind(), EventKind::Exception);
}

#[tokio::test]
async fn test_commands_rejected_while_disconnected() {
    let (registry, _, reference) = open(MockBehavior {
        require_connection: true,
        ..Default::default()
    })
    .await;
    let mut events = registry.event_bus().subscribe();

    let error = registry
        .publish(&reference, "a/b", "x".into(), PublishOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(&error, BridgeError::Engine(e) if e.reason_code == reason::NOT_CONNECTED));
    assert_eq!(
        exceptions(&drain(&mut events)),
        vec![(reason::NOT_CONNECTED, "Client is not connected".to_string())]
    );
}

#[tokio::test]
async fn test_connect_refused_reports_broker_code() {
    let (registry, _, reference) = open(MockBehavior {
        connect_error: Some(EngineError::wrapping(EngineError::new(
            5,
            "Not authorized to connect",
        ))),
        ..Default::default()
    })
    .await;
    let mut events = registry.event_bus().subscribe();

    assert!(registry.connect(&reference).await.is_err());
    assert_eq!(registry.is_connected(&reference).await, Some(false));

    let received = drain(&mut events);
    assert_eq!(received[0].kind(), EventKind::Connecting);
    assert_eq!(
        exceptions(&received),
        vec![(5, "Not authorized to connect".to_string())]
    );
}

#[tokio::test]
async fn test_connect_timeout_then_late_completion_is_ignored() {
    let factory = Arc::new(MockEngineFactory::new(MockBehavior {
        hang_connect: true,
        ..Default::default()
    }));
    let registry = SessionRegistry::new(factory.clone());
    let reference = registry
        .create(
            SessionConfig::builder()
                .address("test.broker", 1883, Protocol::Tcp)
                .unwrap()
                .connection_timeout(Duration::from_millis(50))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
    let mut events = registry.event_bus().subscribe();

    let error = registry.connect(&reference).await.unwrap_err();
    assert!(error.is_timeout());

    let engine = factory.last_engine().unwrap();
    assert!(engine.was_halted());
    engine.complete_connect(Ok(()));

    let kinds: Vec<EventKind> = drain(&mut events).iter().map(BridgeEvent::kind).collect();
    assert_eq!(kinds, vec![EventKind::Connecting]);
    assert_eq!(registry.is_connected(&reference).await, Some(false));
}

#[tokio::test]
async fn test_end_cancels_pending_connect() {
    let (registry, _, reference) = open(MockBehavior {
        hang_connect: true,
        ..Default::default()
    })
    .await;

    let pending = {
        let registry = registry.clone();
        let reference = reference.clone();
        tokio::spawn(async move { registry.connect(&reference).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    registry.end(&reference, true).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("connect should resolve after end")
        .unwrap();
    assert!(matches!(result, Err(BridgeError::Cancelled { .. })));
}

use super::*;
use crate::domain::config::QoSConfig;
use crate::domain::message::{ContentEncoding, Message};
use crate::ports::inbound::HandlerError;
use crate::protocol::BasicProperties;
use crate::testing::MockBroker;
use bytes::Bytes;

const QUEUE: &str = "eventbus_queue";

struct Fixture {
    broker: MockBroker,
    pool: ChannelPool,
    dispatcher: Dispatcher,
}

async fn fixture() -> Fixture {
    let broker = MockBroker::new();
    let conn = broker.connect_raw().await.unwrap();
    Fixture {
        broker,
        pool: ChannelPool::new(conn, Arc::new(QoSConfig::default())),
        dispatcher: Dispatcher::new(Handle::current(), true),
    }
}

fn key() -> GroupKey {
    GroupKey {
        role: Role::Subscribe,
        queue: QUEUE.to_string(),
    }
}

fn spec() -> GroupSpec {
    GroupSpec {
        queue: QueueSpec::shared(true),
        prefetch: None,
    }
}

/// Subscribe with a handler that forwards every message; `fail_on` bodies
/// make it return an error.
async fn subscribe(
    fx: &Fixture,
    pattern: &str,
    ack_mode: AckMode,
    fail_on: &'static str,
) -> (u64, mpsc::UnboundedReceiver<Message>) {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(move |message: Message| {
        let seen_tx = seen_tx.clone();
        async move {
            let failing = message.body == fail_on.as_bytes();
            let _ = seen_tx.send(message);
            if failing {
                Err::<(), HandlerError>("rejected by handler".into())
            } else {
                Ok(())
            }
        }
    });
    let id = fx.dispatcher.next_entry_id();
    let sink = spawn_subscription_worker(&Handle::current(), id, handler, None);
    let entry = Arc::new(SubscriptionEntry {
        id,
        exchange: "events".into(),
        pattern: pattern.into(),
        kind: ExchangeKind::Topic,
        ack_mode,
        sink,
    });
    fx.dispatcher.add(&fx.pool, key(), spec(), entry).await.unwrap();
    (id, seen_rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("handler not invoked")
        .expect("worker stopped")
}

async fn settled(broker: &MockBroker) {
    for _ in 0..200 {
        if broker.unacked_count(QUEUE) == 0 && broker.queue_depth(QUEUE) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "queue not drained: ready={} unacked={}",
        broker.queue_depth(QUEUE),
        broker.unacked_count(QUEUE)
    );
}

#[tokio::test]
async fn test_matching_pattern_delivers_once() {
    let fx = fixture().await;
    let (_id, mut seen) = subscribe(&fx, "orders.*", AckMode::Manual, "").await;
    assert!(fx.broker.has_binding(QUEUE, "events", "orders.*"));
    assert_eq!(fx.broker.exchange_kind("events"), Some(ExchangeKind::Topic));

    fx.broker
        .inject("events", "orders.created", BasicProperties::default(), "o-1");
    let message = recv(&mut seen).await;
    assert_eq!(&message.body[..], b"o-1");
    assert_eq!(message.routing_key(), Some("orders.created"));
    settled(&fx.broker).await;
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn test_overlapping_patterns_each_see_message() {
    let fx = fixture().await;
    let (_a, mut first) = subscribe(&fx, "a.*", AckMode::Manual, "").await;
    let (_b, mut second) = subscribe(&fx, "a.#", AckMode::Auto, "").await;
    let (_c, mut third) = subscribe(&fx, "a.example", AckMode::Manual, "").await;

    fx.broker
        .inject("events", "abc.example", BasicProperties::default(), "nope");
    fx.broker
        .inject("events", "a.b", BasicProperties::default(), "yes");

    assert_eq!(&recv(&mut first).await.body[..], b"yes");
    assert_eq!(&recv(&mut second).await.body[..], b"yes");
    settled(&fx.broker).await;
    assert!(first.try_recv().is_err());
    assert!(second.try_recv().is_err());
    assert!(third.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_manual_handler_rejects_without_requeue() {
    let fx = fixture().await;
    let (_id, mut seen) = subscribe(&fx, "#", AckMode::Manual, "poison").await;

    fx.broker
        .inject("events", "x", BasicProperties::default(), "poison");
    fx.broker.inject("events", "x", BasicProperties::default(), "ok");

    assert_eq!(&recv(&mut seen).await.body[..], b"poison");
    assert_eq!(&recv(&mut seen).await.body[..], b"ok");
    settled(&fx.broker).await;
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn test_undecodable_body_is_dropped() {
    let fx = fixture().await;
    let (_id, mut seen) = subscribe(&fx, "#", AckMode::Manual, "").await;

    let zstd = BasicProperties {
        content_encoding: ContentEncoding::Zstd.as_tag().map(str::to_string),
        ..BasicProperties::default()
    };
    fx.broker
        .inject("events", "x", zstd, Bytes::from_static(b"not zstd"));
    fx.broker.inject("events", "x", BasicProperties::default(), "fine");

    assert_eq!(&recv(&mut seen).await.body[..], b"fine");
    settled(&fx.broker).await;
}

#[tokio::test]
async fn test_deliveries_keep_broker_order() {
    let fx = fixture().await;
    let (_id, mut seen) = subscribe(&fx, "seq.#", AckMode::Manual, "").await;
    for i in 0..50 {
        fx.broker
            .inject("events", "seq.n", BasicProperties::default(), i.to_string());
    }
    for i in 0..50 {
        assert_eq!(recv(&mut seen).await.body, Bytes::from(i.to_string()));
    }
}

#[tokio::test]
async fn test_remove_keeps_shared_binding_until_last() {
    let fx = fixture().await;
    let (a, _seen_a) = subscribe(&fx, "shared.#", AckMode::Manual, "").await;
    let (b, _seen_b) = subscribe(&fx, "shared.#", AckMode::Manual, "").await;
    assert_eq!(fx.broker.consumer_count(QUEUE), 1);

    assert!(fx.dispatcher.remove(Some(&fx.pool), &key(), a).await);
    assert!(fx.broker.has_binding(QUEUE, "events", "shared.#"));
    assert_eq!(fx.broker.consumer_count(QUEUE), 1);

    assert!(fx.dispatcher.remove(Some(&fx.pool), &key(), b).await);
    assert!(!fx.broker.has_binding(QUEUE, "events", "shared.#"));
    assert_eq!(fx.broker.consumer_count(QUEUE), 0);
    assert_eq!(fx.dispatcher.entry_count().await, 0);

    assert!(!fx.dispatcher.remove(Some(&fx.pool), &key(), b).await);
}

#[tokio::test]
async fn test_bind_failure_is_reported_and_rolled_back() {
    let fx = fixture().await;
    // Same exchange name, different type: the broker refuses the declaration.
    let (_id, _seen) = subscribe(&fx, "a.#", AckMode::Manual, "").await;
    let (sink, _rx) = mpsc::unbounded_channel();
    let entry = Arc::new(SubscriptionEntry {
        id: fx.dispatcher.next_entry_id(),
        exchange: "events".into(),
        pattern: "b".into(),
        kind: ExchangeKind::Fanout,
        ack_mode: AckMode::Manual,
        sink,
    });

    let err = fx
        .dispatcher
        .add(&fx.pool, key(), spec(), entry)
        .await
        .unwrap_err();
    match err {
        EventbusError::Bind {
            exchange,
            routing_key,
            reason,
        } => {
            assert_eq!(exchange, "events");
            assert_eq!(routing_key, "b");
            assert!(reason.contains("406"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(fx.dispatcher.entry_count().await, 1);
}

#[tokio::test]
async fn test_bind_failure_keeps_other_subscriptions_consuming() {
    let fx = fixture().await;
    let (_id, mut seen) = subscribe(&fx, "orders.*", AckMode::Manual, "").await;
    fx.broker
        .inject("events", "orders.created", BasicProperties::default(), "before");
    assert_eq!(&recv(&mut seen).await.body[..], b"before");
    settled(&fx.broker).await;

    // Another queue on the same channel, bound to "events" as the wrong type.
    let (sink, _rx) = mpsc::unbounded_channel();
    let entry = Arc::new(SubscriptionEntry {
        id: fx.dispatcher.next_entry_id(),
        exchange: "events".into(),
        pattern: "clash".into(),
        kind: ExchangeKind::Fanout,
        ack_mode: AckMode::Manual,
        sink,
    });
    let audit = GroupKey {
        role: Role::Subscribe,
        queue: "audit".into(),
    };
    let err = fx.dispatcher.add(&fx.pool, audit, spec(), entry).await;
    assert!(matches!(err, Err(EventbusError::Bind { .. })), "{err:?}");

    let lost = fx.dispatcher.lost_consumers();
    let role = tokio::time::timeout(Duration::from_secs(2), async {
        lost.lock().await.recv().await
    })
    .await
    .unwrap();
    assert_eq!(role, Some(Role::Subscribe));

    assert_eq!(fx.broker.consumer_count(QUEUE), 1);
    assert_eq!(fx.dispatcher.entry_count().await, 1);
    fx.broker
        .inject("events", "orders.created", BasicProperties::default(), "after");
    assert_eq!(&recv(&mut seen).await.body[..], b"after");
    settled(&fx.broker).await;
}

#[tokio::test]
async fn test_heal_is_noop_for_live_consumers() {
    let fx = fixture().await;
    let (_id, mut seen) = subscribe(&fx, "h.*", AckMode::Manual, "").await;
    assert_eq!(fx.dispatcher.heal(&fx.pool, Role::Subscribe).await, 0);
    assert_eq!(fx.broker.consumer_count(QUEUE), 1);
    fx.broker
        .inject("events", "h.x", BasicProperties::default(), "once");
    assert_eq!(&recv(&mut seen).await.body[..], b"once");
    settled(&fx.broker).await;
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn test_restore_on_new_connection() {
    let fx = fixture().await;
    let (_id, mut seen) = subscribe(&fx, "r.*", AckMode::Manual, "").await;

    let conn = fx.broker.connect_raw().await.unwrap();
    let pool = ChannelPool::new(conn, Arc::new(QoSConfig::default()));
    fx.pool.close_all().await;
    fx.pool.connection().close().await;

    assert_eq!(fx.dispatcher.restore(&pool).await, 0);
    assert_eq!(fx.broker.consumer_count(QUEUE), 1);
    fx.broker
        .inject("events", "r.x", BasicProperties::default(), "again");
    assert_eq!(&recv(&mut seen).await.body[..], b"again");
}

#[tokio::test]
async fn test_shutdown_stops_workers() {
    let fx = fixture().await;
    let (_id, mut seen) = subscribe(&fx, "#", AckMode::Auto, "").await;
    fx.dispatcher.shutdown().await;
    assert_eq!(fx.dispatcher.entry_count().await, 0);
    assert_eq!(fx.broker.consumer_count(QUEUE), 0);
    assert!(seen.recv().await.is_none());
}

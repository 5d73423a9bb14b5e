//! # Publish/Subscribe Flows
//!
//! Topic routing, per-subscription ordering and acknowledgement through the
//! public `Eventbus` API.
//!
//! ```text
//! publish ──→ [topic exchange] ──→ eventbus_queue ──→ router ──→ handler
//!                                                        │
//!                                                        └──→ handler (2nd match)
//! ```

#[cfg(test)]
mod tests {
    use super::super::{connect, connect_declaring, eventually, within};
    use amqp_eventbus::protocol::BasicProperties;
    use amqp_eventbus::testing::MockBroker;
    use amqp_eventbus::{
        AckMode, ContentEncoding, Eventbus, EventbusError, ExchangeKind, HandlerError,
        HeaderValue, Message, PublishOptions, QoSConfig, SubscribeOptions, SubscriptionHandle,
    };
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(150);

    /// Subscribe with a handler that forwards every message to the returned
    /// receiver.
    async fn collect(
        bus: &Eventbus,
        exchange: &str,
        pattern: &str,
        options: SubscribeOptions,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = bus
            .subscribe(
                exchange,
                pattern,
                move |message: Message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                        Ok::<(), HandlerError>(())
                    }
                },
                options,
            )
            .await
            .unwrap();
        (handle, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        within(WAIT, rx.recv()).await.expect("subscription closed")
    }

    async fn nothing_more(rx: &mut mpsc::UnboundedReceiver<Message>) {
        assert!(tokio::time::timeout(QUIET, rx.recv()).await.is_err());
    }

    // =========================================================================
    // ROUTING
    // =========================================================================

    #[tokio::test]
    async fn test_matching_key_is_delivered_once() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (_sub, mut rx) = collect(&bus, "orders", "orders.*", SubscribeOptions::default()).await;

        let confirmed = bus
            .publish("orders", "orders.created", "{\"id\":1}", PublishOptions::default())
            .await
            .unwrap();
        assert!(confirmed);

        let message = next(&mut rx).await;
        assert_eq!(&message.body[..], b"{\"id\":1}");
        assert_eq!(message.routing_key(), Some("orders.created"));
        assert_eq!(message.exchange(), Some("orders"));
        nothing_more(&mut rx).await;
    }

    #[tokio::test]
    async fn test_token_boundaries_are_respected() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (_sub, mut rx) = collect(&bus, "events", "a.example", SubscribeOptions::default()).await;

        bus.publish("events", "abc.example", "miss", PublishOptions::default())
            .await
            .unwrap();
        bus.publish("events", "a.example", "hit", PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(&next(&mut rx).await.body[..], b"hit");
        nothing_more(&mut rx).await;
    }

    #[tokio::test]
    async fn test_wildcards() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (_star, mut star) = collect(&bus, "logs", "app.*.error", SubscribeOptions::default()).await;
        let (_hash, mut hash) = collect(&bus, "logs", "app.#", SubscribeOptions::default()).await;

        for key in ["app.db.error", "app.db.pool.error", "app"] {
            bus.publish("logs", key, key, PublishOptions::default())
                .await
                .unwrap();
        }

        assert_eq!(&next(&mut star).await.body[..], b"app.db.error");
        nothing_more(&mut star).await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(next(&mut hash).await.body);
        }
        assert_eq!(
            seen,
            vec![
                Bytes::from_static(b"app.db.error"),
                Bytes::from_static(b"app.db.pool.error"),
                Bytes::from_static(b"app"),
            ]
        );
    }

    #[tokio::test]
    async fn test_separate_queues_each_get_a_copy() {
        let broker = MockBroker::new();
        let billing = connect(&broker, QoSConfig::default()).await;
        let shipping = connect(&broker, QoSConfig::default()).await;
        let (_a, mut a) = collect(
            &billing,
            "orders",
            "orders.#",
            SubscribeOptions::default().with_queue("billing"),
        )
        .await;
        let (_b, mut b) = collect(
            &shipping,
            "orders",
            "orders.#",
            SubscribeOptions::default().with_queue("shipping"),
        )
        .await;

        billing
            .publish("orders", "orders.paid", "42", PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(&next(&mut a).await.body[..], b"42");
        assert_eq!(&next(&mut b).await.body[..], b"42");
    }

    #[tokio::test]
    async fn test_messages_arrive_in_publish_order() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (_sub, mut rx) = collect(&bus, "ticks", "tick", SubscribeOptions::default()).await;

        for n in 0..50u32 {
            bus.publish("ticks", "tick", n.to_string(), PublishOptions::default())
                .await
                .unwrap();
        }
        for n in 0..50u32 {
            assert_eq!(next(&mut rx).await.body, Bytes::from(n.to_string()));
        }
    }

    #[tokio::test]
    async fn test_properties_survive_the_round_trip() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (_sub, mut rx) = collect(&bus, "events", "#", SubscribeOptions::default()).await;

        let body = "x".repeat(4096);
        for encoding in [
            ContentEncoding::Zlib,
            ContentEncoding::Zstd,
            ContentEncoding::Lz4,
        ] {
            bus.publish(
                "events",
                "compressed",
                body.clone(),
                PublishOptions::default()
                    .with_content_type("text/plain")
                    .with_encoding(encoding)
                    .with_header("tenant", "acme"),
            )
            .await
            .unwrap();

            let message = next(&mut rx).await;
            assert_eq!(message.body, Bytes::from(body.clone()));
            assert_eq!(message.content_encoding, encoding);
            assert_eq!(message.content_type.as_deref(), Some("text/plain"));
            assert_eq!(
                message.headers.get("tenant"),
                Some(&HeaderValue::from("acme"))
            );
        }

        let on_wire = broker.published();
        assert!(on_wire.iter().all(|m| m.body.len() < body.len()));
    }

    // =========================================================================
    // ACKNOWLEDGEMENT
    // =========================================================================

    #[tokio::test]
    async fn test_manual_ack_settles_after_handler() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (_sub, mut rx) = collect(
            &bus,
            "jobs",
            "job.*",
            SubscribeOptions::default().with_ack_mode(AckMode::Manual),
        )
        .await;

        bus.publish("jobs", "job.run", "1", PublishOptions::default())
            .await
            .unwrap();
        next(&mut rx).await;
        assert!(eventually(WAIT, || broker.unacked_count("eventbus_queue") == 0).await);
        assert_eq!(broker.queue_depth("eventbus_queue"), 0);
    }

    #[tokio::test]
    async fn test_failed_handler_does_not_block_the_next_message() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus
            .subscribe(
                "jobs",
                "job.*",
                move |message: Message| {
                    let tx = tx.clone();
                    async move {
                        if &message.body[..] == b"bad" {
                            return Err::<(), HandlerError>("cannot process".into());
                        }
                        let _ = tx.send(message);
                        Ok(())
                    }
                },
                SubscribeOptions::default().with_ack_mode(AckMode::Manual),
            )
            .await
            .unwrap();

        bus.publish("jobs", "job.run", "bad", PublishOptions::default())
            .await
            .unwrap();
        bus.publish("jobs", "job.run", "good", PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(&next(&mut rx).await.body[..], b"good");
        assert!(eventually(WAIT, || broker.unacked_count("eventbus_queue") == 0).await);
        assert_eq!(broker.queue_depth("eventbus_queue"), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_subscription_alive() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus
            .subscribe(
                "jobs",
                "#",
                move |message: Message| {
                    let tx = tx.clone();
                    async move {
                        if &message.body[..] == b"boom" {
                            panic!("handler blew up");
                        }
                        let _ = tx.send(message);
                        Ok::<(), HandlerError>(())
                    }
                },
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        bus.publish("jobs", "k", "boom", PublishOptions::default())
            .await
            .unwrap();
        bus.publish("jobs", "k", "after", PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(&next(&mut rx).await.body[..], b"after");
    }

    #[tokio::test]
    async fn test_undecodable_body_is_dropped() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (_sub, mut rx) = collect(&bus, "events", "#", SubscribeOptions::default()).await;

        let corrupt = BasicProperties {
            content_encoding: Some("zstd".into()),
            ..BasicProperties::default()
        };
        assert_eq!(broker.inject("events", "k", corrupt, "not zstd"), 1);
        bus.publish("events", "k", "fine", PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(&next(&mut rx).await.body[..], b"fine");
        nothing_more(&mut rx).await;
        assert!(eventually(WAIT, || broker.unacked_count("eventbus_queue") == 0).await);
    }

    // =========================================================================
    // CANCELLATION
    // =========================================================================

    #[tokio::test]
    async fn test_cancelled_subscription_stops_receiving() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (sub, mut rx) = collect(&bus, "events", "a.*", SubscribeOptions::default()).await;
        let (_other, mut other) = collect(&bus, "events", "b.*", SubscribeOptions::default()).await;
        assert_eq!(bus.subscription_count().await, 2);

        sub.cancel().await.unwrap();
        assert_eq!(bus.subscription_count().await, 1);

        bus.publish("events", "a.x", "gone", PublishOptions::default())
            .await
            .unwrap();
        bus.publish("events", "b.x", "kept", PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(&next(&mut other).await.body[..], b"kept");
        assert!(within(WAIT, rx.recv()).await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_handle_keeps_subscription() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (sub, mut rx) = collect(&bus, "events", "#", SubscribeOptions::default()).await;
        drop(sub);

        bus.publish("events", "k", "still here", PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(&next(&mut rx).await.body[..], b"still here");
    }

    #[tokio::test]
    async fn test_third_party_publish_is_received() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (_sub, mut rx) = collect(&bus, "events", "ext.*", SubscribeOptions::default()).await;

        let properties = BasicProperties {
            content_type: Some("application/json".into()),
            ..BasicProperties::default()
        };
        broker.inject("events", "ext.ping", properties, Bytes::from_static(b"{}"));

        let message = next(&mut rx).await;
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert_eq!(message.routing_key(), Some("ext.ping"));
    }

    // =========================================================================
    // CHANNEL FAILURES
    // =========================================================================

    #[tokio::test]
    async fn test_refused_subscribe_keeps_existing_subscriptions() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (_sub, mut rx) = collect(&bus, "orders", "orders.*", SubscribeOptions::default()).await;
        bus.publish("orders", "orders.created", "before", PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(&next(&mut rx).await.body[..], b"before");

        let other = connect_declaring(&broker, ExchangeKind::Fanout).await;
        other
            .publish("clash", "k", "x", PublishOptions::default())
            .await
            .unwrap();
        let err = bus
            .subscribe(
                "clash",
                "k",
                |_: Message| async { Ok::<(), HandlerError>(()) },
                SubscribeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventbusError::Bind { .. }), "unexpected error: {err}");
        assert_eq!(bus.subscription_count().await, 1);

        bus.publish("orders", "orders.created", "after", PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(&next(&mut rx).await.body[..], b"after");
        assert!(eventually(WAIT, || broker.queue_depth("eventbus_queue") == 0).await);
    }
}

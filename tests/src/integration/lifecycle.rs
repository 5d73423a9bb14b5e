//! # Lifecycle Flows
//!
//! Publisher confirms, connection loss and recovery, disposal and
//! connection-time failures.

#[cfg(test)]
mod tests {
    use super::super::{connect, eventually, wait_for_state, within};
    use amqp_eventbus::testing::MockBroker;
    use amqp_eventbus::{
        BusState, Eventbus, EventbusError, HandlerError, Message, PublishOptions, QoSConfig,
        ReconnectPolicy, SubscribeOptions,
    };
    use futures::future::join_all;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    async fn forward_all(bus: &Eventbus, exchange: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(
            exchange,
            "#",
            move |message: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                    Ok::<(), HandlerError>(())
                }
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
        rx
    }

    /// Publish `body` until the subscription sees it. Publishes made while
    /// the bus is still reconnecting may fail or be lost with the old session.
    async fn publish_until_seen(
        bus: &Eventbus,
        rx: &mut mpsc::UnboundedReceiver<Message>,
        exchange: &str,
        body: &'static str,
    ) {
        let seen = async {
            loop {
                let _ = bus
                    .publish(exchange, "k", body, PublishOptions::default())
                    .await;
                if let Ok(Some(message)) =
                    tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
                {
                    if &message.body[..] == body.as_bytes() {
                        return;
                    }
                }
            }
        };
        within(WAIT, seen).await;
    }

    // =========================================================================
    // PUBLISHER CONFIRMS
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_publishes_resolve_exactly_once() {
        let broker = MockBroker::new();
        broker.set_confirm_batch(8);
        let bus = connect(&broker, QoSConfig::default()).await;

        let publishes = (0..64).map(|n| {
            let bus = bus.clone();
            async move {
                bus.publish("metrics", "cpu", format!("{n}"), PublishOptions::default())
                    .await
            }
        });
        let results = within(WAIT, join_all(publishes)).await;
        assert_eq!(results.len(), 64);
        assert!(results.into_iter().all(|r| r == Ok(true)));
        assert_eq!(broker.published().len(), 64);
    }

    #[tokio::test]
    async fn test_nacked_publish_is_rejected() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        broker.set_nack_publishes(true);

        let err = bus
            .publish("metrics", "cpu", "1", PublishOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, EventbusError::PublishRejected);

        broker.set_nack_publishes(false);
        assert!(bus
            .publish("metrics", "cpu", "2", PublishOptions::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_publish_timeout_on_unresponsive_broker() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        bus.publish("metrics", "cpu", "warm-up", PublishOptions::default())
            .await
            .unwrap();
        broker.freeze_connections();

        let err = within(
            WAIT,
            bus.publish(
                "metrics",
                "cpu",
                "stuck",
                PublishOptions::default().with_timeout(Duration::from_millis(100)),
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(err, EventbusError::PublishTimeout(Duration::from_millis(100)));
    }

    // =========================================================================
    // RECONNECTION
    // =========================================================================

    #[tokio::test]
    async fn test_subscriptions_survive_a_dropped_connection() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let mut rx = forward_all(&bus, "events").await;
        publish_until_seen(&bus, &mut rx, "events", "before").await;

        broker.drop_connections();
        publish_until_seen(&bus, &mut rx, "events", "after").await;

        assert!(wait_for_state(&bus, BusState::Ready, WAIT).await);
        assert_eq!(broker.connection_count(), 1);
        assert_eq!(bus.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_broker_close_triggers_reconnect() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let mut rx = forward_all(&bus, "events").await;

        broker.close_connections(320, "CONNECTION_FORCED - broker restarting");
        publish_until_seen(&bus, &mut rx, "events", "back").await;
        assert_eq!(bus.state(), BusState::Ready);
    }

    #[tokio::test]
    async fn test_reconnect_waits_for_broker_to_return() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let mut rx = forward_all(&bus, "events").await;

        broker.refuse_connections(true);
        broker.drop_connections();
        assert!(eventually(WAIT, || bus.state() == BusState::Connecting).await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(bus.state(), BusState::Connecting);
        assert_eq!(broker.connection_count(), 0);

        broker.refuse_connections(false);
        assert!(wait_for_state(&bus, BusState::Ready, WAIT).await);
        publish_until_seen(&bus, &mut rx, "events", "recovered").await;
    }

    #[tokio::test]
    async fn test_disabled_reconnect_stays_down() {
        let broker = MockBroker::new();
        let config = broker.config().with_reconnect(ReconnectPolicy::disabled());
        let bus = Eventbus::builder(config, QoSConfig::default())
            .connector(broker.connector())
            .connect()
            .await
            .unwrap();

        broker.drop_connections();
        assert!(eventually(WAIT, || bus.state() == BusState::Connecting).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.connection_count(), 0);

        // The next operation dials again on demand.
        bus.ready().await.unwrap();
        assert_eq!(broker.connection_count(), 1);
    }

    // =========================================================================
    // DISPOSAL
    // =========================================================================

    #[tokio::test]
    async fn test_graceful_dispose_closes_everything() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let _rx = forward_all(&bus, "events").await;
        assert_eq!(broker.consumer_count("eventbus_queue"), 1);

        within(WAIT, bus.dispose(true)).await.unwrap();
        assert_eq!(bus.state(), BusState::Closed);
        assert!(eventually(WAIT, || broker.connection_count() == 0).await);
        assert_eq!(broker.consumer_count("eventbus_queue"), 0);
        assert_eq!(bus.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_operations_after_dispose_fail_fast() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        within(WAIT, bus.dispose(false)).await.unwrap();

        assert_eq!(
            bus.publish("events", "k", "x", PublishOptions::default())
                .await
                .unwrap_err(),
            EventbusError::Disposed
        );
        let err = bus
            .subscribe(
                "events",
                "#",
                |_m: Message| async { Ok::<(), HandlerError>(()) },
                SubscribeOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, EventbusError::Disposed);
        assert_eq!(bus.ready().await.unwrap_err(), EventbusError::Disposed);
    }

    #[tokio::test]
    async fn test_dispose_abandons_unconfirmed_publish() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        // Declares the exchange so the next publish only waits on its confirm.
        bus.publish("events", "k", "warm", PublishOptions::default())
            .await
            .unwrap();

        broker.freeze_connections();
        let publish = tokio::spawn({
            let bus = bus.clone();
            async move {
                bus.publish("events", "k", "stuck", PublishOptions::default())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publish.is_finished());

        within(WAIT, bus.dispose(false)).await.unwrap();
        let err = within(WAIT, publish).await.unwrap().unwrap_err();
        assert!(err.is_cancellation(), "unexpected error: {err}");
        assert_eq!(bus.state(), BusState::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_dispose_calls_agree() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let (a, b) = tokio::join!(bus.dispose(true), bus.dispose(false));
        a.unwrap();
        b.unwrap();
        assert_eq!(bus.state(), BusState::Closed);
    }

    #[tokio::test]
    async fn test_state_transitions_are_observable() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let mut states = bus.watch_state();
        assert_eq!(*states.borrow_and_update(), BusState::Ready);

        let disposing = tokio::spawn({
            let bus = bus.clone();
            async move { bus.dispose(true).await }
        });
        within(WAIT, states.wait_for(|s| *s == BusState::Closed))
            .await
            .unwrap();
        disposing.await.unwrap().unwrap();
    }

    // =========================================================================
    // CONNECTION FAILURES
    // =========================================================================

    #[tokio::test]
    async fn test_bad_credentials_are_an_auth_error() {
        let broker = MockBroker::new();
        let mut config = broker.config();
        config.password = "wrong".into();

        let err = Eventbus::builder(config, QoSConfig::default())
            .connector(broker.connector())
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, EventbusError::Auth(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_custom_user_and_vhost() {
        let broker = MockBroker::new()
            .with_user("svc", "s3cret")
            .with_vhost("/billing");
        let mut config = broker.config();
        config.username = "svc".into();
        config.password = "s3cret".into();
        config.virtual_host = "/billing".into();

        let bus = Eventbus::builder(config, QoSConfig::default())
            .connector(broker.connector())
            .connect()
            .await
            .unwrap();
        assert_eq!(bus.state(), BusState::Ready);
    }

    #[tokio::test]
    async fn test_unknown_vhost_is_refused() {
        let broker = MockBroker::new();
        let mut config = broker.config();
        config.virtual_host = "/missing".into();

        let err = Eventbus::builder(config, QoSConfig::default())
            .connector(broker.connector())
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, EventbusError::Connection(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let broker = MockBroker::new();
        broker.refuse_connections(true);

        let err = Eventbus::builder(broker.config(), QoSConfig::default())
            .connector(broker.connector())
            .connect()
            .await
            .unwrap_err();
        assert!(err.is_connection_failure());
    }
}

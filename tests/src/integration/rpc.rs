//! # RPC Flows
//!
//! Request/response between a caller and resource providers, including the
//! error-reply path and call deadlines.
//!
//! ```text
//! caller ──request(correlation_id, reply_to)──→ [rpc exchange] ──→ provider
//!    ↑                                                                │
//!    └──────────── reply(correlation_id) ←── [default exchange] ←─────┘
//! ```

#[cfg(test)]
mod tests {
    use super::super::{connect, connect_declaring, eventually, within};
    use amqp_eventbus::testing::MockBroker;
    use amqp_eventbus::{
        ContentEncoding, Eventbus, EventbusError, ExchangeKind, HandlerError, Message,
        ProvideOptions, PublishOptions, QoSConfig, RpcOptions,
    };
    use bytes::Bytes;
    use futures::future::join_all;
    use std::collections::HashSet;
    use std::time::Duration;

    const RPC: &str = "eventbus_rpc_exchange";
    const WAIT: Duration = Duration::from_secs(5);

    fn deadline(ms: u64) -> RpcOptions {
        RpcOptions::default().with_timeout(Duration::from_millis(ms))
    }

    async fn echo_provider(bus: &Eventbus, routing_key: &str) {
        bus.provide_resource(routing_key, |request: Message| async move {
            Ok::<Bytes, HandlerError>(request.body)
        })
        .await
        .unwrap();
    }

    // =========================================================================
    // ROUND TRIP
    // =========================================================================

    #[tokio::test]
    async fn test_echo_round_trip() {
        let broker = MockBroker::new();
        let server = connect(&broker, QoSConfig::default()).await;
        let client = connect(&broker, QoSConfig::default()).await;
        echo_provider(&server, "svc.echo").await;

        let reply = client
            .rpc_client(RPC, "svc.echo", "ping", deadline(5_000))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"ping");
        assert_eq!(client.pending_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_same_bus_can_call_itself() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        bus.rpc_server("svc.len", |request: Message| async move {
            Ok::<Bytes, HandlerError>(Bytes::from(request.body.len().to_string()))
        })
        .await
        .unwrap();

        let reply = bus
            .rpc_client(RPC, "svc.len", "hello", deadline(5_000))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"5");
    }

    #[tokio::test]
    async fn test_reply_keeps_request_encoding() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        echo_provider(&bus, "svc.echo").await;

        let body = "payload ".repeat(512);
        let request = Message::new(body.clone())
            .with_content_type("text/plain")
            .with_encoding(ContentEncoding::Zstd);
        let reply = bus
            .rpc_call(RPC, "svc.echo", request, Some(WAIT))
            .await
            .unwrap();
        assert_eq!(reply.body, Bytes::from(body));
        assert_eq!(reply.content_encoding, ContentEncoding::Zstd);
        assert_eq!(reply.content_type.as_deref(), Some("text/plain"));
        assert!(!reply.is_error_reply());
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_to_their_own_replies() {
        let broker = MockBroker::new();
        let server = connect(&broker, QoSConfig::default()).await;
        let client = connect(&broker, QoSConfig::default()).await;
        server
            .provide_resource("svc.square", |request: Message| async move {
                let n: u64 = std::str::from_utf8(&request.body)?.parse()?;
                tokio::time::sleep(Duration::from_millis(n % 7)).await;
                Ok::<Bytes, HandlerError>(Bytes::from((n * n).to_string()))
            })
            .await
            .unwrap();

        let calls = (0..64u64).map(|n| {
            let client = client.clone();
            async move {
                let reply = client
                    .rpc_client(RPC, "svc.square", n.to_string(), deadline(10_000))
                    .await
                    .unwrap();
                (n, reply)
            }
        });
        for (n, reply) in join_all(calls).await {
            assert_eq!(reply, Bytes::from((n * n).to_string()));
        }

        let ids: HashSet<_> = broker
            .published()
            .into_iter()
            .filter(|m| m.exchange == RPC)
            .filter_map(|m| m.properties.correlation_id)
            .collect();
        assert_eq!(ids.len(), 64);
        assert_eq!(client.pending_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_providers_on_different_keys() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        bus.provide_resource("svc.upper", |r: Message| async move {
            Ok::<Bytes, HandlerError>(Bytes::from(r.body.to_ascii_uppercase()))
        })
        .await
        .unwrap();
        bus.provide_resource("svc.lower", |r: Message| async move {
            Ok::<Bytes, HandlerError>(Bytes::from(r.body.to_ascii_lowercase()))
        })
        .await
        .unwrap();

        let upper = bus.rpc_client(RPC, "svc.upper", "MiXeD", deadline(5_000));
        let lower = bus.rpc_client(RPC, "svc.lower", "MiXeD", deadline(5_000));
        let (upper, lower) = tokio::join!(upper, lower);
        assert_eq!(&upper.unwrap()[..], b"MIXED");
        assert_eq!(&lower.unwrap()[..], b"mixed");
    }

    // =========================================================================
    // ERROR REPLIES
    // =========================================================================

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        bus.provide_resource("svc.validate", |_r: Message| async move {
            Err::<Bytes, HandlerError>("sku not found".into())
        })
        .await
        .unwrap();

        let body = bus
            .rpc_client(RPC, "svc.validate", "sku-9", deadline(5_000))
            .await
            .unwrap();
        assert_eq!(&body[..], b"Error: sku not found");

        let reply = bus
            .rpc_call(RPC, "svc.validate", Message::new("sku-9"), Some(WAIT))
            .await
            .unwrap();
        assert!(reply.is_error_reply());
        assert_eq!(reply.error_text().as_deref(), Some("sku not found"));
    }

    #[tokio::test]
    async fn test_panicking_provider_still_replies() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        bus.provide_resource("svc.crash", |r: Message| async move {
            if &r.body[..] == b"crash" {
                panic!("out of cheese");
            }
            Ok::<Bytes, HandlerError>(r.body)
        })
        .await
        .unwrap();

        let body = bus
            .rpc_client(RPC, "svc.crash", "crash", deadline(5_000))
            .await
            .unwrap();
        assert_eq!(&body[..], b"Error: handler panicked: out of cheese");

        let body = bus
            .rpc_client(RPC, "svc.crash", "fine", deadline(5_000))
            .await
            .unwrap();
        assert_eq!(&body[..], b"fine");
    }

    #[tokio::test]
    async fn test_slow_provider_is_cut_off() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        bus.provide_resource_with(
            "svc.slow",
            |_r: Message| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<Bytes, HandlerError>(Bytes::new())
            },
            ProvideOptions::default().with_handler_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        let reply = bus
            .rpc_call(RPC, "svc.slow", Message::new("x"), Some(WAIT))
            .await
            .unwrap();
        assert!(reply.is_error_reply());
        assert!(reply
            .error_text()
            .unwrap()
            .starts_with("handler timed out"));
    }

    // =========================================================================
    // DEADLINES AND CANCELLATION
    // =========================================================================

    #[tokio::test]
    async fn test_call_without_provider_times_out() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;

        let started = tokio::time::Instant::now();
        let err = bus
            .rpc_client(RPC, "svc.nobody", "hello", deadline(200))
            .await
            .unwrap_err();
        assert_eq!(err, EventbusError::RpcTimeout(Duration::from_millis(200)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < WAIT);
        assert_eq!(bus.pending_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_is_ignored() {
        let broker = MockBroker::new();
        let server = connect(&broker, QoSConfig::default()).await;
        let client = connect(&broker, QoSConfig::default()).await;
        server
            .provide_resource("svc.late", |r: Message| async move {
                if &r.body[..] == b"slow" {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                Ok::<Bytes, HandlerError>(r.body)
            })
            .await
            .unwrap();

        let err = client
            .rpc_client(RPC, "svc.late", "slow", deadline(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EventbusError::RpcTimeout(_)));

        // The stale reply lands on the reply queue without resolving anything.
        let stale_reply_seen = eventually(WAIT, || {
            broker
                .published()
                .iter()
                .any(|m| m.exchange.is_empty() && &m.body[..] == b"slow")
        })
        .await;
        assert!(stale_reply_seen);

        let reply = client
            .rpc_client(RPC, "svc.late", "fast", deadline(5_000))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"fast");
        assert_eq!(client.pending_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_releases_entry() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;

        let call = tokio::spawn({
            let bus = bus.clone();
            async move { bus.rpc_client(RPC, "svc.nobody", "x", RpcOptions::default()).await }
        });
        assert!(eventually(WAIT, || bus.pending_rpc_count() == 1).await);
        call.abort();
        assert!(eventually(WAIT, || bus.pending_rpc_count() == 0).await);
    }

    #[tokio::test]
    async fn test_dispose_cancels_waiting_calls() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let bus = bus.clone();
                tokio::spawn(async move {
                    bus.rpc_client(RPC, "svc.nobody", "x", RpcOptions::default())
                        .await
                })
            })
            .collect();
        assert!(eventually(WAIT, || bus.pending_rpc_count() == 3).await);
        let sent = || broker.published().iter().filter(|m| m.exchange == RPC).count();
        assert!(eventually(WAIT, || sent() == 3).await);

        within(WAIT, bus.dispose(false)).await.unwrap();
        for call in calls {
            let err = within(WAIT, call).await.unwrap().unwrap_err();
            assert!(err.is_cancellation(), "unexpected error: {err}");
        }
        assert_eq!(
            bus.rpc_client(RPC, "svc.nobody", "x", deadline(100))
                .await
                .unwrap_err(),
            EventbusError::Disposed
        );
    }

    #[tokio::test]
    async fn test_lost_connection_fails_waiting_calls() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;

        let call = tokio::spawn({
            let bus = bus.clone();
            async move { bus.rpc_client(RPC, "svc.nobody", "x", RpcOptions::default()).await }
        });
        assert!(eventually(WAIT, || bus.pending_rpc_count() == 1).await);
        assert!(eventually(WAIT, || broker.published().iter().any(|m| m.exchange == RPC)).await);

        broker.drop_connections();
        let err = within(WAIT, call).await.unwrap().unwrap_err();
        assert!(
            matches!(
                err,
                EventbusError::ConnectionLost(_) | EventbusError::PublishAbandoned(_)
            ),
            "unexpected error: {err}"
        );
        assert_eq!(bus.pending_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_provider_stops_answering() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let provider = bus
            .provide_resource("svc.echo", |r: Message| async move {
                Ok::<Bytes, HandlerError>(r.body)
            })
            .await
            .unwrap();
        assert_eq!(provider.routing_key(), "svc.echo");
        bus.rpc_client(RPC, "svc.echo", "1", deadline(5_000))
            .await
            .unwrap();

        provider.cancel().await.unwrap();
        let err = bus
            .rpc_client(RPC, "svc.echo", "2", deadline(200))
            .await
            .unwrap_err();
        assert!(matches!(err, EventbusError::RpcTimeout(_)));
    }

    // =========================================================================
    // CHANNEL FAILURES
    // =========================================================================

    #[tokio::test]
    async fn test_reply_channel_error_fails_waiting_calls() {
        let broker = MockBroker::new();
        let bus = connect(&broker, QoSConfig::default()).await;
        let other = connect_declaring(&broker, ExchangeKind::Fanout).await;
        other
            .publish("clash", "k", "x", PublishOptions::default())
            .await
            .unwrap();

        let waiting = tokio::spawn({
            let bus = bus.clone();
            async move { bus.rpc_client(RPC, "svc.nobody", "x", RpcOptions::default()).await }
        });
        assert!(eventually(WAIT, || bus.pending_rpc_count() == 1).await);
        assert!(eventually(WAIT, || broker.published().iter().any(|m| m.exchange == RPC)).await);

        // Declaring "clash" as a topic exchange closes the rpc-client channel.
        let err = bus
            .rpc_client("clash", "k", "x", deadline(5_000))
            .await
            .unwrap_err();
        assert!(
            matches!(err, EventbusError::Channel { code: 406, .. }),
            "unexpected error: {err}"
        );

        let err = within(WAIT, waiting).await.unwrap().unwrap_err();
        assert!(matches!(err, EventbusError::Channel { .. }), "unexpected error: {err}");
        assert_eq!(bus.pending_rpc_count(), 0);

        echo_provider(&bus, "svc.echo").await;
        let reply = bus
            .rpc_client(RPC, "svc.echo", "again", deadline(5_000))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"again");
    }
}

//! # TLS Transport
//!
//! The eventbus over a TLS-wrapped connection, with certificates generated
//! per test.

#[cfg(test)]
mod tests {
    use super::super::within;
    use amqp_eventbus::testing::MockBroker;
    use amqp_eventbus::{
        BusState, Eventbus, EventbusError, HandlerError, Message, PublishOptions, QoSConfig,
        ReconnectPolicy, RpcOptions, TlsAdaptor,
    };
    use bytes::Bytes;
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use rustls::pki_types::PrivateKeyDer;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn self_signed(name: &str) -> CertifiedKey {
        generate_simple_self_signed(vec![name.to_string()]).unwrap()
    }

    fn server_config(ck: &CertifiedKey) -> Arc<rustls::ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let key = PrivateKeyDer::try_from(ck.key_pair.serialize_der()).unwrap();
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![ck.cert.der().clone()], key)
            .unwrap();
        Arc::new(config)
    }

    fn tls_broker(ck: &CertifiedKey) -> MockBroker {
        MockBroker::new().with_tls(server_config(ck))
    }

    async fn connect_tls(
        broker: &MockBroker,
        trusted: &CertifiedKey,
        server_name: &str,
    ) -> Result<Eventbus, EventbusError> {
        let adaptor =
            TlsAdaptor::without_client_auth(Some(trusted.cert.pem().as_bytes()), server_name)?;
        let config = broker
            .config()
            .with_tls(adaptor)
            .with_reconnect(ReconnectPolicy::disabled());
        Eventbus::builder(config, QoSConfig::default())
            .connector(broker.connector())
            .connect()
            .await
    }

    #[tokio::test]
    async fn test_rpc_over_tls() {
        let ck = self_signed("localhost");
        let broker = tls_broker(&ck);
        let bus = within(WAIT, connect_tls(&broker, &ck, "localhost"))
            .await
            .unwrap();
        assert_eq!(bus.state(), BusState::Ready);

        bus.provide_resource("svc.echo", |r: Message| async move {
            Ok::<Bytes, HandlerError>(r.body)
        })
        .await
        .unwrap();
        let reply = bus
            .rpc_client(
                "eventbus_rpc_exchange",
                "svc.echo",
                "over tls",
                RpcOptions::default().with_timeout(WAIT),
            )
            .await
            .unwrap();
        assert_eq!(&reply[..], b"over tls");

        assert!(bus
            .publish("events", "k", "x", PublishOptions::default())
            .await
            .unwrap());
        bus.dispose(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_name_mismatch_fails_handshake() {
        let ck = self_signed("localhost");
        let broker = tls_broker(&ck);

        let err = within(WAIT, connect_tls(&broker, &ck, "broker.example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventbusError::TlsHandshake(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_untrusted_certificate_fails_handshake() {
        let served = self_signed("localhost");
        let other = self_signed("localhost");
        let broker = tls_broker(&served);

        let err = within(WAIT, connect_tls(&broker, &other, "localhost"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventbusError::TlsHandshake(_)), "unexpected error: {err}");
    }
}

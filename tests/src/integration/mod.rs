//! Integration flows and the fixtures they share.

pub mod lifecycle;
pub mod pubsub;
pub mod rpc;
pub mod tls;

use amqp_eventbus::testing::MockBroker;
use amqp_eventbus::{BusState, ConfigOptions, Eventbus, ExchangeKind, QoSConfig};
use std::future::Future;
use std::time::Duration;

/// Connect a bus to `broker` with the given QoS.
pub async fn connect(broker: &MockBroker, qos: QoSConfig) -> Eventbus {
    Eventbus::builder(broker.config(), qos)
        .connector(broker.connector())
        .connect()
        .await
        .expect("bus should connect to the mock broker")
}

/// Connect a bus that declares its pub/sub exchanges as `kind`. Publishing
/// through it claims an exchange name with that type.
pub async fn connect_declaring(broker: &MockBroker, kind: ExchangeKind) -> Eventbus {
    let options = ConfigOptions {
        exchange_kind: kind,
        ..ConfigOptions::default()
    };
    Eventbus::builder(broker.config_with(options), QoSConfig::default())
        .connector(broker.connector())
        .connect()
        .await
        .expect("bus should connect to the mock broker")
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for the bus to reach `state`.
pub async fn wait_for_state(bus: &Eventbus, state: BusState, within: Duration) -> bool {
    let mut rx = bus.watch_state();
    tokio::time::timeout(within, rx.wait_for(|s| *s == state))
        .await
        .is_ok_and(|r| r.is_ok())
}

/// Await `fut`, failing the test if it takes longer than `limit`.
pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, fut)
        .await
        .expect("operation did not finish in time")
}

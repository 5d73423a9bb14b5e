//! The eventbus facade.
//!
//! An [`Eventbus`] owns one broker session at a time: a connection plus its
//! per-role channels. Subscriptions and providers are registered with the
//! dispatcher, not the session, so they survive a reconnect. A supervisor
//! task watches each session. It re-attaches consumers whose channel the
//! broker closed and, when the connection is lost, fails pending RPC calls and
//! reconnects according to the [`ReconnectPolicy`].
//!
//! [`ReconnectPolicy`]: crate::domain::config::ReconnectPolicy

use crate::adapters::tcp::TcpConnector;
use crate::channel::{Channel, ChannelPool, QueueSpec};
use crate::connection::Connection;
use crate::dispatch::{
    spawn_subscription_worker, AckMode, Dispatcher, GroupKey, GroupSpec, LostConsumers,
    SubscribeOptions, SubscriptionEntry,
};
use crate::domain::codec;
use crate::domain::config::{Config, QoSConfig, Role};
use crate::domain::errors::{EventbusError, Result};
use crate::domain::message::{ContentEncoding, DeliveryMode, HeaderValue, Headers, Message};
use crate::ports::inbound::{MessageHandler, ResourceHandler};
use crate::ports::outbound::Connector;
use crate::protocol::BasicProperties;
use crate::rpc::{spawn_provider_worker, ReplyRoute, RequestPath, RpcClient};
use async_trait::async_trait;
use bytes::Bytes;
use eventbus_telemetry::{log_event, metric_inc, RECONNECTS};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Lifecycle of an [`Eventbus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// No usable connection yet, or reconnecting after a loss.
    Connecting,
    Ready,
    Disposing,
    Closed,
}

/// Per-call publish settings.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub content_type: Option<String>,
    pub content_encoding: ContentEncoding,
    /// Give up waiting for the broker confirm after this long.
    pub timeout: Option<Duration>,
    /// Per-message TTL.
    pub expiration: Option<Duration>,
    pub headers: Headers,
    pub delivery_mode: DeliveryMode,
}

impl PublishOptions {
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.content_encoding = encoding;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    fn into_message(self, body: Bytes) -> (Message, Option<Duration>) {
        let message = Message {
            body,
            content_type: self.content_type,
            content_encoding: self.content_encoding,
            headers: self.headers,
            expiration: self.expiration,
            delivery_mode: self.delivery_mode,
            ..Message::default()
        };
        (message, self.timeout)
    }
}

/// Per-call RPC settings. Without a timeout the call waits until a reply
/// arrives, the connection is lost or the bus is disposed.
#[derive(Debug, Clone, Default)]
pub struct RpcOptions {
    pub content_type: Option<String>,
    pub content_encoding: ContentEncoding,
    pub timeout: Option<Duration>,
    /// TTL of the request message.
    pub expiration: Option<Duration>,
    pub headers: Headers,
    pub delivery_mode: DeliveryMode,
}

impl RpcOptions {
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.content_encoding = encoding;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    fn into_message(self, body: Bytes) -> (Message, Option<Duration>) {
        let message = Message {
            body,
            content_type: self.content_type,
            content_encoding: self.content_encoding,
            headers: self.headers,
            expiration: self.expiration,
            delivery_mode: self.delivery_mode,
            ..Message::default()
        };
        (message, self.timeout)
    }
}

/// Resource provider settings.
#[derive(Debug, Clone, Default)]
pub struct ProvideOptions {
    /// Answer with an error reply when the handler runs longer than this.
    pub handler_timeout: Option<Duration>,
    pub prefetch: Option<u16>,
}

impl ProvideOptions {
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }
}

/// One connection and the channels opened on it.
struct Session {
    pool: ChannelPool,
    runtime: Handle,
    rpc: Arc<RpcClient>,
    exchanges: Mutex<HashSet<String>>,
    reply: tokio::sync::Mutex<Option<ReplyRoute>>,
    config: Arc<Config>,
}

impl Session {
    fn connection(&self) -> &Arc<Connection> {
        self.pool.connection()
    }

    fn is_live(&self) -> bool {
        !self.connection().is_closed()
    }

    /// Declare `exchange` once per session before the first publish to it.
    async fn ensure_exchange(&self, channel: &Channel, exchange: &str) -> Result<()> {
        if exchange.is_empty() || self.exchanges.lock().contains(exchange) {
            return Ok(());
        }
        let options = &self.config.options;
        channel
            .declare_exchange(exchange, options.kind_for(exchange), options.durable)
            .await?;
        self.exchanges.lock().insert(exchange.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        role: Role,
        exchange: &str,
        routing_key: &str,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let channel = self.pool.get(role).await?;
        self.ensure_exchange(&channel, exchange).await?;
        if self.connection().is_blocked() {
            debug!(exchange, routing_key, "Publishing while the broker blocks the connection");
        }
        let body = codec::encode(&message.body, message.content_encoding)?;
        let properties = BasicProperties::from_message(&message);
        let Some(confirm) = channel.publish(exchange, routing_key, properties, body)? else {
            return Ok(false);
        };
        let confirmed = async {
            confirm
                .await
                .map_err(|_| EventbusError::PublishAbandoned("confirm dropped".into()))?
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, confirmed)
                .await
                .map_err(|_| EventbusError::PublishTimeout(limit))??,
            None => confirmed.await?,
        }
        Ok(true)
    }
}

#[async_trait]
impl RequestPath for Session {
    async fn reply_address(&self) -> Result<ReplyRoute> {
        let mut reply = self.reply.lock().await;
        if let Some(route) = reply.as_ref() {
            if !route.closed.is_cancelled() {
                return Ok(route.clone());
            }
        }
        let channel = self.pool.get(Role::RpcClient).await?;
        let route = self.rpc.open_reply_queue(&channel, &self.runtime).await?;
        *reply = Some(route.clone());
        Ok(route)
    }

    async fn send_request(&self, exchange: &str, routing_key: &str, request: Message) -> Result<()> {
        self.publish(Role::RpcClient, exchange, routing_key, request, None)
            .await
            .map(|_| ())
    }
}

struct Inner {
    config: Arc<Config>,
    qos: Arc<QoSConfig>,
    connector: Arc<dyn Connector>,
    runtime: Handle,
    state: watch::Sender<BusState>,
    session: RwLock<Option<Arc<Session>>>,
    connect_lock: tokio::sync::Mutex<()>,
    dispatcher: Dispatcher,
    rpc: Arc<RpcClient>,
    disposed: CancellationToken,
    inflight: AtomicUsize,
    drained: Notify,
}

/// Counts an operation as in flight until dropped.
struct Operation<'a> {
    inner: &'a Inner,
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl Inner {
    fn begin(&self) -> Result<Operation<'_>> {
        if self.disposed.is_cancelled() {
            return Err(EventbusError::Disposed);
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        Ok(Operation { inner: self })
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .as_ref()
            .filter(|session| session.is_live())
            .cloned()
    }

    fn set_state(&self, state: BusState) {
        self.state.send_if_modified(|current| {
            let allowed = match *current {
                BusState::Closed => false,
                BusState::Disposing => state == BusState::Closed,
                _ => true,
            };
            let changed = allowed && *current != state;
            if changed {
                *current = state;
            }
            changed
        });
    }

    /// The live session, connecting first if there is none.
    async fn ensure_session(self: &Arc<Self>) -> Result<Arc<Session>> {
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        if self.disposed.is_cancelled() {
            return Err(EventbusError::Disposed);
        }
        let _connecting = self.connect_lock.lock().await;
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        self.open_session().await
    }

    async fn open_session(self: &Arc<Self>) -> Result<Arc<Session>> {
        self.set_state(BusState::Connecting);
        let conn = tokio::select! {
            _ = self.disposed.cancelled() => return Err(EventbusError::Disposed),
            conn = Connection::open(&self.config, self.connector.as_ref(), self.runtime.clone()) => conn?,
        };
        let session = Arc::new(Session {
            pool: ChannelPool::new(conn.clone(), self.qos.clone()),
            runtime: self.runtime.clone(),
            rpc: self.rpc.clone(),
            exchanges: Mutex::new(HashSet::new()),
            reply: tokio::sync::Mutex::new(None),
            config: self.config.clone(),
        });

        let failures = self.dispatcher.restore(&session.pool).await;
        if failures > 0 {
            warn!(failures, "Some subscriptions could not be restored");
        }
        *self.session.write() = Some(session.clone());
        if self.disposed.is_cancelled() {
            self.detach_session(&session);
            conn.abort("eventbus disposed");
            return Err(EventbusError::Disposed);
        }
        self.set_state(BusState::Ready);
        self.runtime
            .spawn(supervise(Arc::downgrade(self), session.clone()));
        log_event!(
            info,
            "eventbus",
            "Eventbus connected",
            connection = conn.id(),
            address = %self.config.address()
        );
        Ok(session)
    }

    fn detach_session(&self, session: &Arc<Session>) {
        let mut slot = self.session.write();
        if slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            *slot = None;
        }
    }

    async fn drain(&self, limit: Duration) {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.inflight.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(limit, wait).await.is_err() {
            warn!(
                inflight = self.inflight.load(Ordering::Acquire),
                ?limit,
                "Drain timed out, cancelling remaining operations"
            );
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.disposed.cancel();
        self.rpc
            .pending()
            .fail_all(&EventbusError::RpcCancelled("eventbus dropped".into()));
        if let Some(session) = self.session.get_mut().take() {
            session.connection().abort("eventbus dropped");
        }
    }
}

async fn next_lost(lost: &LostConsumers) -> Option<Role> {
    lost.lock().await.recv().await
}

/// Re-attach consumers the broker closes while the session's connection is
/// up, and reconnect once the connection goes away. Boxed because a
/// successful reconnect spawns the next supervisor.
fn supervise(weak: Weak<Inner>, session: Arc<Session>) -> BoxFuture<'static, ()> {
    async move { watch_session(weak, session).await }.boxed()
}

async fn watch_session(weak: Weak<Inner>, session: Arc<Session>) {
    let Some((disposed, lost)) = weak
        .upgrade()
        .map(|inner| (inner.disposed.clone(), inner.dispatcher.lost_consumers()))
    else {
        return;
    };
    let conn = session.connection().clone();
    loop {
        let role = tokio::select! {
            _ = conn.shutdown_token().cancelled() => break,
            _ = disposed.cancelled() => return,
            Some(role) = next_lost(&lost) => role,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let failures = inner.dispatcher.heal(&session.pool, role).await;
        if failures > 0 {
            warn!(role = %role, failures, "Consumers not restored after channel close");
        }
    }

    let policy = {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.disposed.is_cancelled() {
            return;
        }
        let lost = conn.lost_error();
        inner.detach_session(&session);
        let failed = inner.rpc.pending().fail_all(&lost);
        inner.set_state(BusState::Connecting);
        log_event!(
            warn,
            "eventbus",
            "Connection lost",
            connection = conn.id(),
            failed_rpcs = failed,
            error = %lost
        );
        inner.config.reconnect.clone()
    };
    drop(session);

    if !policy.enabled {
        return;
    }
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if policy.max_attempts.is_some_and(|max| attempt > max) {
            error!(attempts = attempt - 1, "Reconnect attempts exhausted");
            return;
        }
        tokio::select! {
            _ = disposed.cancelled() => return,
            _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match inner.ensure_session().await {
            Ok(_) => {
                metric_inc!(RECONNECTS, &["success"]);
                log_event!(info, "eventbus", "Reconnected", attempt);
                return;
            }
            Err(EventbusError::Disposed) => return,
            Err(e @ (EventbusError::Auth(_) | EventbusError::TlsHandshake(_))) => {
                metric_inc!(RECONNECTS, &["failed"]);
                error!(attempt, error = %e, "Reconnect refused, giving up");
                return;
            }
            Err(e) => {
                metric_inc!(RECONNECTS, &["failed"]);
                warn!(attempt, error = %e, "Reconnect attempt failed");
            }
        }
    }
}

/// Builds an [`Eventbus`] with a custom connector or runtime.
pub struct EventbusBuilder {
    config: Config,
    qos: QoSConfig,
    connector: Option<Arc<dyn Connector>>,
    runtime: Option<Handle>,
}

impl EventbusBuilder {
    /// Transport used to reach the broker. Defaults to [`TcpConnector`].
    #[must_use]
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Runtime every internal task is spawned on. Defaults to the runtime of
    /// the calling context.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn assemble(self) -> Result<Eventbus> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| {
                EventbusError::Config("no tokio runtime; call from async context or set one".into())
            })?,
        };
        let (state, _) = watch::channel(BusState::Connecting);
        let durable = self.config.options.durable;
        let disposed = CancellationToken::new();
        let inner = Inner {
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(TcpConnector::new())),
            rpc: Arc::new(RpcClient::new(
                self.qos.rpc_client_auto_ack,
                disposed.clone(),
            )),
            config: Arc::new(self.config),
            qos: Arc::new(self.qos),
            dispatcher: Dispatcher::new(runtime.clone(), durable),
            runtime,
            state,
            session: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            disposed,
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
        };
        Ok(Eventbus {
            inner: Arc::new(inner),
        })
    }

    /// Create the bus and start connecting in the background. Operations
    /// issued before the connection is up wait for it.
    pub fn build(self) -> Result<Eventbus> {
        let bus = self.assemble()?;
        let weak = Arc::downgrade(&bus.inner);
        bus.inner.runtime.spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(e) = inner.ensure_session().await {
                if !matches!(e, EventbusError::Disposed) {
                    warn!(error = %e, "Initial connection failed; retrying on next use");
                }
            }
        });
        Ok(bus)
    }

    /// Create the bus and wait for the first connection.
    pub async fn connect(self) -> Result<Eventbus> {
        let bus = self.assemble()?;
        bus.inner.ensure_session().await?;
        Ok(bus)
    }
}

/// Asynchronous AMQP eventbus: publish/subscribe and request/response over
/// one broker connection. Clones share the same connection.
#[derive(Clone)]
pub struct Eventbus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Eventbus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eventbus")
            .field("address", &self.inner.config.address())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Eventbus {
    /// Create a bus that connects in the background.
    pub fn new(config: Config, qos: QoSConfig) -> Result<Self> {
        Self::builder(config, qos).build()
    }

    pub fn builder(config: Config, qos: QoSConfig) -> EventbusBuilder {
        EventbusBuilder {
            config,
            qos,
            connector: None,
            runtime: None,
        }
    }

    /// Create a bus and wait until it is connected.
    pub async fn connect(config: Config, qos: QoSConfig) -> Result<Self> {
        Self::builder(config, qos).connect().await
    }

    /// Wait for a live connection, connecting if needed.
    pub async fn ready(&self) -> Result<()> {
        let _op = self.inner.begin()?;
        self.inner.ensure_session().await.map(|_| ())
    }

    pub fn state(&self) -> BusState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<BusState> {
        self.inner.state.subscribe()
    }

    /// RPC calls currently awaiting a reply.
    pub fn pending_rpc_count(&self) -> usize {
        self.inner.rpc.pending().pending_count()
    }

    /// Registered subscriptions and providers.
    pub async fn subscription_count(&self) -> usize {
        self.inner.dispatcher.entry_count().await
    }

    /// Publish `body`. Returns `Ok(true)` once the broker confirmed it and
    /// `Ok(false)` when the publish channel does not track confirms.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
        options: PublishOptions,
    ) -> Result<bool> {
        let (message, timeout) = options.into_message(body.into());
        self.publish_message(exchange, routing_key, message, timeout)
            .await
    }

    /// Publish a prepared message. `timeout` bounds the wait for the confirm.
    pub async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let _op = self.inner.begin()?;
        let session = self.inner.ensure_session().await?;
        session
            .publish(Role::Publish, exchange, routing_key, message, timeout)
            .await
    }

    /// Invoke `handler` for every message published to `exchange` whose
    /// routing key matches `pattern`.
    ///
    /// The subscription lives until [`SubscriptionHandle::cancel`] or
    /// disposal; dropping the handle does not cancel it.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        exchange: &str,
        pattern: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        let _op = self.inner.begin()?;
        if exchange.is_empty() {
            return Err(EventbusError::Bind {
                exchange: String::new(),
                routing_key: pattern.to_string(),
                reason: "cannot bind to the default exchange".into(),
            });
        }
        let inner = &self.inner;
        let ack_mode = options.ack_mode.unwrap_or(if inner.qos.sub_auto_ack {
            AckMode::Auto
        } else {
            AckMode::Manual
        });
        let key = GroupKey {
            role: Role::Subscribe,
            queue: options
                .queue
                .unwrap_or_else(|| inner.config.options.queue_name.clone()),
        };
        let spec = GroupSpec {
            queue: QueueSpec::shared(inner.config.options.durable),
            prefetch: options.prefetch,
        };

        let session = inner.ensure_session().await?;
        let id = inner.dispatcher.next_entry_id();
        let sink = spawn_subscription_worker(
            &inner.runtime,
            id,
            Arc::new(handler),
            options.handler_timeout,
        );
        let entry = Arc::new(SubscriptionEntry {
            id,
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
            kind: inner.config.options.kind_for(exchange),
            ack_mode,
            sink,
        });
        inner
            .dispatcher
            .add(&session.pool, key.clone(), spec, entry)
            .await?;
        Ok(SubscriptionHandle {
            registration: Registration {
                id,
                key,
                inner: Arc::downgrade(inner),
            },
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        })
    }

    /// Send `body` as a request and return the reply body. Provider failures
    /// arrive as error replies; see [`Message::is_error_reply`].
    pub async fn rpc_client(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
        options: RpcOptions,
    ) -> Result<Bytes> {
        let (request, timeout) = options.into_message(body.into());
        let reply = self.rpc_call(exchange, routing_key, request, timeout).await?;
        Ok(reply.body)
    }

    /// Send a prepared request and return the whole reply message.
    pub async fn rpc_call(
        &self,
        exchange: &str,
        routing_key: &str,
        request: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let _op = self.inner.begin()?;
        let session = self.inner.ensure_session().await?;
        self.inner
            .rpc
            .call(session.as_ref(), exchange, routing_key, request, timeout)
            .await
    }

    /// Serve requests sent to `routing_key` on the RPC exchange.
    pub async fn provide_resource<H: ResourceHandler>(
        &self,
        routing_key: &str,
        handler: H,
    ) -> Result<ProviderHandle> {
        self.provide_resource_with(routing_key, handler, ProvideOptions::default())
            .await
    }

    /// Alias of [`provide_resource`](Self::provide_resource).
    pub async fn rpc_server<H: ResourceHandler>(
        &self,
        routing_key: &str,
        handler: H,
    ) -> Result<ProviderHandle> {
        self.provide_resource(routing_key, handler).await
    }

    pub async fn provide_resource_with<H: ResourceHandler>(
        &self,
        routing_key: &str,
        handler: H,
        options: ProvideOptions,
    ) -> Result<ProviderHandle> {
        let _op = self.inner.begin()?;
        let inner = &self.inner;
        let exchange = inner.config.options.rpc_exchange_name.clone();
        let key = GroupKey {
            role: Role::RpcServer,
            queue: inner.config.options.rpc_queue_name.clone(),
        };
        let spec = GroupSpec {
            queue: QueueSpec::shared(inner.config.options.durable),
            prefetch: options.prefetch,
        };
        let ack_mode = if inner.qos.rpc_server_auto_ack {
            AckMode::Auto
        } else {
            AckMode::Manual
        };

        let session = inner.ensure_session().await?;
        let id = inner.dispatcher.next_entry_id();
        let sink = spawn_provider_worker(
            &inner.runtime,
            id,
            routing_key.to_string(),
            Arc::new(handler),
            options.handler_timeout,
        );
        let entry = Arc::new(SubscriptionEntry {
            id,
            kind: inner.config.options.kind_for(&exchange),
            exchange,
            pattern: routing_key.to_string(),
            ack_mode,
            sink,
        });
        inner
            .dispatcher
            .add(&session.pool, key.clone(), spec, entry)
            .await?;
        Ok(ProviderHandle {
            registration: Registration {
                id,
                key,
                inner: Arc::downgrade(inner),
            },
            routing_key: routing_key.to_string(),
        })
    }

    /// Shut the bus down. Graceful disposal first waits (up to the configured
    /// drain timeout) for in-flight operations. Pending RPC calls and
    /// publishes are then cancelled, consumers stopped and the connection
    /// closed. Calling it again is a no-op.
    pub async fn dispose(&self, graceful: bool) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.is_cancelled() {
            let mut state = inner.state.subscribe();
            let _ = state.wait_for(|s| *s == BusState::Closed).await;
            return Ok(());
        }
        inner.set_state(BusState::Disposing);
        inner.disposed.cancel();
        log_event!(info, "eventbus", "Disposing eventbus", graceful);

        if graceful {
            inner.drain(inner.config.tuning.dispose_drain_timeout).await;
        }
        let cancelled = inner
            .rpc
            .pending()
            .fail_all(&EventbusError::RpcCancelled("eventbus disposed".into()));

        let session = inner.session.write().take();
        if let Some(session) = &session {
            let abandoned = session.pool.abandon_confirms("eventbus disposed");
            debug!(cancelled_rpcs = cancelled, abandoned_publishes = abandoned, "Pending work cancelled");
            if !graceful {
                session.connection().abort("eventbus disposed");
            }
        }
        inner.dispatcher.shutdown().await;
        if let Some(session) = session {
            if graceful {
                session.pool.close_all().await;
                session.connection().close().await;
            }
        }

        inner.set_state(BusState::Closed);
        log_event!(info, "eventbus", "Eventbus closed");
        Ok(())
    }
}

/// Ties a handle to its dispatcher entry without keeping the bus alive.
struct Registration {
    id: u64,
    key: GroupKey,
    inner: Weak<Inner>,
}

impl Registration {
    async fn cancel(self) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let session = inner.current_session();
        let removed = inner
            .dispatcher
            .remove(session.as_ref().map(|s| &s.pool), &self.key, self.id)
            .await;
        if !removed {
            debug!(entry = self.id, "Cancelled entry was already gone");
        }
        Ok(())
    }
}

/// Handle to a subscription created by [`Eventbus::subscribe`].
pub struct SubscriptionHandle {
    registration: Registration,
    exchange: String,
    pattern: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.registration.id
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Stop the subscription. Messages already handed to the handler still
    /// complete.
    pub async fn cancel(self) -> Result<()> {
        self.registration.cancel().await
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.registration.id)
            .field("exchange", &self.exchange)
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Handle to a resource provider.
pub struct ProviderHandle {
    registration: Registration,
    routing_key: String,
}

impl ProviderHandle {
    pub fn id(&self) -> u64 {
        self.registration.id
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub async fn cancel(self) -> Result<()> {
        self.registration.cancel().await
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.registration.id)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

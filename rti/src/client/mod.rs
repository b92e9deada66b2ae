//! RtiClient - pub/sub client built on one transport session
//!
//! The client owns the identity announced to peers, the local handler table
//! with federation-aware channel naming, the directory of channels, clients
//! and measures learned from the bus, and the session-bound command registry.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rti::{ClientConfig, RtiClient, proto::Measurement};
//!
//! let client = RtiClient::new(ClientConfig::for_application("Viewer"));
//! client.connect()?;
//! client.wait_until_connected(Duration::from_secs(5)).await?;
//!
//! client.subscribe("rti/measurement", |channel, m: Measurement| {
//!     println!("{}: {} = {}", channel, m.measure_id, m.value);
//!     Ok(())
//! });
//! ```

mod commands;
mod measures;
pub mod naming;
mod presence;
pub mod registry;
pub mod subscriptions;

pub use commands::{CommandHandler, CommandRegistry, CommandRequest, DEFAULT_COMMAND_TIMEOUT};
pub use subscriptions::SubscriptionId;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::constants::{VERSION, channel};
use crate::error::{RtiError, RtiResult};
use crate::events::{ClientEvent, EventBus};
use crate::measure::MeasurementAggregator;
use crate::proto::{self, Channel, ChannelUse, Client, Measure, RuntimeState};
use crate::transport::{self, SchedulingStrategy, SessionObserver, TransportSession};
use registry::Directory;
use subscriptions::{RawHandler, Subscriptions};

/// Interval between connection checks in [`RtiClient::wait_until_connected`]
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Who this client is, as announced in presence records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientIdentity {
    pub application: String,
    pub application_version: Option<String>,
    pub engine_version: Option<String>,
    pub integration_version: Option<String>,
    pub client_id: String,
    pub federation: Option<String>,
    pub host: Option<String>,
    pub station: Option<String>,
    pub user: Option<String>,
    pub participant: Option<String>,
    pub role: Option<String>,
    pub full_name: Option<String>,
    pub capabilities: Vec<String>,
}

impl ClientIdentity {
    fn from_config(config: &ClientConfig) -> Self {
        Self {
            application: config.application.clone(),
            application_version: config.application_version.clone(),
            engine_version: Some(
                config
                    .engine_version
                    .clone()
                    .unwrap_or_else(|| format!("Rust rti {}", VERSION)),
            ),
            integration_version: config.integration_version.clone(),
            client_id: config
                .client_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            federation: config.resolved_federation(),
            host: config.resolved_host(),
            station: config.station.clone().filter(|s| !s.is_empty()),
            user: config.user.clone(),
            participant: config.participant.clone(),
            role: config.role.clone(),
            full_name: config.full_name.clone(),
            capabilities: config.capabilities.clone(),
        }
    }

    /// Credentials transmitted with the `auth` event
    fn credentials(&self, secret: Option<&str>, password: Option<&str>) -> Value {
        let mut credentials = json!({
            "application": self.application,
            "clientId": self.client_id,
            "clientLibraryVersion": VERSION,
        });
        if let Some(map) = credentials.as_object_mut() {
            if let Some(secret) = secret.filter(|s| !s.is_empty()) {
                map.insert("secret".to_string(), json!(secret));
            }
            if let Some(user) = self.user.as_deref() {
                map.insert("user".to_string(), json!(user));
            }
            if let Some(password) = password {
                map.insert("password".to_string(), json!(password));
            }
            if let Some(federation) = self.federation.as_deref() {
                map.insert("federation".to_string(), json!(federation));
            }
        }
        credentials
    }
}

pub(crate) struct ClientInner {
    self_ref: Weak<ClientInner>,
    identity: RwLock<ClientIdentity>,
    credentials: Value,
    incognito: bool,
    scheduling: SchedulingStrategy,
    transport: Arc<TransportSession>,
    events: EventBus,
    state: RwLock<RuntimeState>,
    connected: AtomicBool,
    first_connected: AtomicBool,
    broker_version: RwLock<Option<String>>,
    connection_error: RwLock<Option<RtiError>>,
    subscriptions: Mutex<Subscriptions>,
    directory: RwLock<Directory>,
    aggregator: Arc<MeasurementAggregator>,
    commands: CommandRegistry,
}

impl ClientInner {
    fn handle(&self) -> Option<RtiClient> {
        self.self_ref.upgrade().map(|inner| RtiClient { inner })
    }

    fn send_credentials(&self) {
        if let Err(e) = self.transport.transmit("auth", self.credentials.clone(), None) {
            warn!(error = %e, "Failed to transmit credentials");
        }
    }

    /// Deliver one wire-channel payload to every local handler
    fn dispatch(&self, wire_channel: &str, content: &str) {
        let Some((channel, handlers)) = self.subscriptions.lock().handlers(wire_channel) else {
            return;
        };
        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&channel, content)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic),
            };
            let failure = RtiError::Handler {
                scope: channel.clone(),
                message: message.clone(),
            };
            error!(error = %failure, "Handler failed");
            self.events.error(&channel, message);
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic in handler".to_string()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        debug!("ClientInner::drop: shutting down");
        self.transport.disconnect();
        self.aggregator.shutdown();
    }
}

impl SessionObserver for ClientInner {
    fn on_open(&self) {
        *self.connection_error.write() = None;
    }

    fn on_close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Disconnected");
            self.events.emit(ClientEvent::Disconnect);
        }
    }

    fn on_connection_error(&self, error: &RtiError) {
        *self.connection_error.write() = Some(error.clone());
        self.events.error(error.scope(), error.to_string());
    }

    fn on_auth_ack(&self, _socket_id: &str, _is_authenticated: bool) {
        self.send_credentials();
    }

    fn on_authenticated(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        let first = !self.first_connected.swap(true, Ordering::SeqCst);
        info!(first, "Connected");
        if !self.incognito
            && let Some(client) = self.handle()
        {
            client.publish_client();
            client.publish_measures();
        }
        if first {
            self.events.emit(ClientEvent::FirstConnect);
        }
        self.events.emit(ClientEvent::Connect);
    }

    fn on_token_missing(&self) {
        if self.connected.load(Ordering::SeqCst) {
            self.send_credentials();
        }
    }

    fn on_protocol_error(&self, error: &RtiError) {
        self.events.error(error.scope(), error.to_string());
    }

    fn on_unhandled_event(&self, name: &str, data: &Value) {
        let payload = match data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.events.message(name, payload);
    }
}

/// Handle to one client session; clones share the session
#[derive(Clone)]
pub struct RtiClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl RtiClient {
    /// Build a client from resolved configuration; does not connect
    pub fn new(config: ClientConfig) -> Self {
        let identity = ClientIdentity::from_config(&config);
        debug!(application = %identity.application, client_id = %identity.client_id, "RtiClient::new: called");

        let secret = config.secret.as_deref();
        let credentials = identity.credentials(secret, config.password.as_deref());
        let transport = Arc::new(TransportSession::new(config.resolved_url(), config.transport_options()));
        let aggregator = Arc::new(MeasurementAggregator::new(
            identity.client_id.clone(),
            config.measurement_tick(),
            config.measurement_time_scale,
        ));

        let inner = Arc::new_cyclic(|weak| ClientInner {
            self_ref: weak.clone(),
            identity: RwLock::new(identity),
            credentials,
            incognito: config.incognito,
            scheduling: config.scheduling,
            transport,
            events: EventBus::default(),
            state: RwLock::new(RuntimeState::Unknown),
            connected: AtomicBool::new(false),
            first_connected: AtomicBool::new(false),
            broker_version: RwLock::new(None),
            connection_error: RwLock::new(None),
            subscriptions: Mutex::new(Subscriptions::default()),
            directory: RwLock::new(Directory::default()),
            aggregator,
            commands: CommandRegistry::default(),
        });
        let observer: Weak<dyn SessionObserver> = Arc::downgrade(&inner) as Weak<dyn SessionObserver>;
        inner.transport.set_observer(observer);

        let client = Self { inner };
        client.install_server_events();
        client.subscribe_directory();
        client
    }

    fn install_server_events(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.on_event(
            "fail",
            Arc::new(move |_, data| {
                if let Some(inner) = weak.upgrade() {
                    let message = data.as_str().map(str::to_string).unwrap_or_else(|| data.to_string());
                    warn!(%message, "Broker reported failure");
                    *inner.connection_error.write() = Some(RtiError::Authentication(message.clone()));
                    inner.events.error("fail", message);
                }
                Ok(Value::Null)
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.on_event(
            "broker-version",
            Arc::new(move |_, data| {
                if let Some(inner) = weak.upgrade() {
                    let version = data.as_str().map(str::to_string).unwrap_or_else(|| data.to_string());
                    debug!(%version, "Broker version");
                    *inner.broker_version.write() = Some(version);
                }
                Ok(Value::Null)
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.on_event(
            "ping",
            Arc::new(move |_, data| {
                if let Some(inner) = weak.upgrade()
                    && let Err(e) = inner.transport.transmit("pong", data.clone(), None)
                {
                    debug!(error = %e, "Failed to answer ping event");
                }
                Ok(Value::Null)
            }),
        );
    }

    // === Connection ===

    /// Start connecting with the configured scheduling strategy
    ///
    /// With [`SchedulingStrategy::OwnedThread`] an I/O task is spawned on the
    /// current tokio runtime; repeated calls while it runs are coalesced. With
    /// [`SchedulingStrategy::ExternalLoop`] the caller drives I/O through
    /// [`RtiClient::run_main_loop`] instead.
    pub fn connect(&self) -> RtiResult<()> {
        debug!(url = %self.inner.transport.url(), "RtiClient::connect: called");
        *self.inner.connection_error.write() = None;
        match self.inner.scheduling {
            SchedulingStrategy::OwnedThread => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(RtiError::Precondition("connect requires a tokio runtime".to_string()));
                }
                transport::spawn_owned(&self.inner.transport);
                Ok(())
            }
            SchedulingStrategy::ExternalLoop { .. } => Err(RtiError::Precondition(
                "Client uses an external loop; drive it with run_main_loop".to_string(),
            )),
        }
    }

    /// Drive I/O from the calling task, invoking `callback` once per idle interval
    ///
    /// Returns after [`RtiClient::disconnect`] once the socket is closed.
    pub async fn run_main_loop<F: FnMut()>(&self, callback: F) -> RtiResult<()> {
        let Some(idle) = self.inner.scheduling.idle_interval() else {
            return Err(RtiError::Precondition(
                "Client owns its I/O task; use connect".to_string(),
            ));
        };
        debug!(?idle, "RtiClient::run_main_loop: called");
        *self.inner.connection_error.write() = None;
        transport::drive_external(&self.inner.transport, callback, idle).await
    }

    /// Close the socket and stop reconnecting
    pub fn disconnect(&self) {
        debug!("RtiClient::disconnect: called");
        self.inner.transport.disconnect();
        self.inner.first_connected.store(false, Ordering::SeqCst);
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.inner.events.emit(ClientEvent::Disconnect);
        }
    }

    /// Wait until authenticated, polling at a short fixed interval
    ///
    /// Fails early with the connection error if one was reported, and with
    /// [`RtiError::Timeout`] otherwise.
    pub async fn wait_until_connected(&self, timeout: Duration) -> RtiResult<()> {
        debug!(?timeout, "RtiClient::wait_until_connected: called");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return Ok(());
            }
            if let Some(error) = self.inner.connection_error.read().clone() {
                return Err(error);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RtiError::Timeout("Connection timeout".to_string()));
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Receiver for lifecycle events emitted after this call
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    // === Identity and state ===

    pub fn identity(&self) -> ClientIdentity {
        self.inner.identity.read().clone()
    }

    pub fn client_id(&self) -> String {
        self.inner.identity.read().client_id.clone()
    }

    pub fn application(&self) -> String {
        self.inner.identity.read().application.clone()
    }

    pub fn federation(&self) -> Option<String> {
        self.inner.identity.read().federation.clone()
    }

    pub fn is_incognito(&self) -> bool {
        self.inner.incognito
    }

    pub fn url(&self) -> String {
        self.inner.transport.url().to_string()
    }

    /// Prefix of this client's private channels (`@{clientId}:`)
    pub fn own_channel_prefix(&self) -> String {
        naming::identity_scoped(&self.client_id(), "")
    }

    pub fn auth_token(&self) -> Option<String> {
        self.inner.transport.auth_token()
    }

    pub fn broker_version(&self) -> Option<String> {
        self.inner.broker_version.read().clone()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.inner.identity.read().capabilities.clone()
    }

    /// Add a capability tag if not already present
    pub fn add_capability(&self, capability: &str) {
        let mut identity = self.inner.identity.write();
        if !identity.capabilities.iter().any(|c| c == capability) {
            identity.capabilities.push(capability.to_string());
        }
    }

    pub fn state(&self) -> RuntimeState {
        *self.inner.state.read()
    }

    /// Set the lifecycle state; presence is published only when it changed
    pub fn set_state(&self, state: RuntimeState) {
        {
            let mut current = self.inner.state.write();
            if *current == state {
                return;
            }
            debug!(from = %*current, to = %state, "RtiClient::set_state: called");
            *current = state;
        }
        if self.is_connected() && !self.inner.incognito {
            self.publish_client();
        }
    }

    pub(crate) fn transport(&self) -> &Arc<TransportSession> {
        &self.inner.transport
    }

    // === Subscriptions ===

    /// Subscribe to a protobuf channel
    pub fn subscribe<M, F>(&self, channel: &str, handler: F) -> SubscriptionId
    where
        M: prost::Message + Default + 'static,
        F: Fn(&str, M) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with(channel, true, handler)
    }

    /// Subscribe to a protobuf channel, optionally without recording channel usage
    pub fn subscribe_with<M, F>(&self, channel: &str, register: bool, handler: F) -> SubscriptionId
    where
        M: prost::Message + Default + 'static,
        F: Fn(&str, M) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let raw: RawHandler = Arc::new(move |channel: &str, content: &str| {
            let message: M = proto::decode(content)?;
            handler(channel, message)
        });
        self.subscribe_raw(channel, register, &proto::type_tag::<M>(), raw)
    }

    /// Subscribe to a JSON channel
    pub fn subscribe_json<T, F>(&self, channel: &str, handler: F) -> SubscriptionId
    where
        T: DeserializeOwned + 'static,
        F: Fn(&str, T) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_json_with(channel, true, handler)
    }

    pub fn subscribe_json_with<T, F>(&self, channel: &str, register: bool, handler: F) -> SubscriptionId
    where
        T: DeserializeOwned + 'static,
        F: Fn(&str, T) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let raw: RawHandler = Arc::new(move |channel: &str, content: &str| {
            let value: T = serde_json::from_str(content)?;
            handler(channel, value)
        });
        self.subscribe_raw(channel, register, "json", raw)
    }

    /// Subscribe to a raw text channel
    pub fn subscribe_text<F>(&self, channel: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&str, &str) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_text_with(channel, true, handler)
    }

    pub fn subscribe_text_with<F>(&self, channel: &str, register: bool, handler: F) -> SubscriptionId
    where
        F: Fn(&str, &str) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_raw(channel, register, "text", Arc::new(handler))
    }

    fn subscribe_raw(&self, channel: &str, register: bool, data_type: &str, handler: RawHandler) -> SubscriptionId {
        let wire = naming::wire_name(self.federation().as_deref(), channel);
        debug!(%channel, %wire, %data_type, "RtiClient::subscribe: called");
        let (subscription, first) = self.inner.subscriptions.lock().add(&wire, channel, handler);
        if first {
            let weak = Arc::downgrade(&self.inner);
            self.inner.transport.on_channel(
                &wire,
                Arc::new(move |wire_channel, content| {
                    if let Some(inner) = weak.upgrade() {
                        inner.dispatch(wire_channel, content);
                    }
                }),
            );
            if let Err(e) = self.inner.transport.subscribe(&wire, None) {
                warn!(%wire, error = %e, "Transport subscribe failed");
            }
        }
        if register {
            self.record_channel_usage(channel, false, data_type);
        }
        subscription
    }

    /// Remove one handler; the last handler on a channel unsubscribes it
    pub fn unsubscribe(&self, subscription: &SubscriptionId) {
        debug!(wire = %subscription.wire_channel, "RtiClient::unsubscribe: called");
        let last = self.inner.subscriptions.lock().remove(subscription);
        if last {
            self.unsubscribe_wire(&subscription.wire_channel);
        }
    }

    /// Remove every handler on a channel
    pub fn unsubscribe_channel(&self, channel: &str) {
        let wire = naming::wire_name(self.federation().as_deref(), channel);
        debug!(%channel, %wire, "RtiClient::unsubscribe_channel: called");
        self.inner.subscriptions.lock().remove_channel(&wire);
        self.unsubscribe_wire(&wire);
    }

    fn unsubscribe_wire(&self, wire: &str) {
        self.inner.transport.off_channel(wire);
        if let Err(e) = self.inner.transport.unsubscribe(wire, None) {
            warn!(%wire, error = %e, "Transport unsubscribe failed");
        }
    }

    /// Number of local handlers on a logical channel
    pub fn handler_count(&self, channel: &str) -> usize {
        let wire = naming::wire_name(self.federation().as_deref(), channel);
        self.inner.subscriptions.lock().handler_count(&wire)
    }

    // === Publishing ===

    /// Publish a protobuf message
    pub fn publish<M: prost::Message>(&self, channel: &str, message: &M) -> RtiResult<()> {
        self.record_channel_usage(channel, true, &proto::type_tag::<M>());
        self.publish_content(channel, &proto::encode(message))
    }

    pub fn publish_text(&self, channel: &str, content: &str) -> RtiResult<()> {
        self.record_channel_usage(channel, true, "text");
        self.publish_content(channel, content)
    }

    pub fn publish_json<T: Serialize + ?Sized>(&self, channel: &str, value: &T) -> RtiResult<()> {
        self.record_channel_usage(channel, true, "json");
        let content = serde_json::to_string(value)?;
        self.publish_content(channel, &content)
    }

    fn publish_content(&self, channel: &str, content: &str) -> RtiResult<()> {
        let wire = naming::wire_name(self.federation().as_deref(), channel);
        self.inner.transport.publish(&wire, content, None)
    }

    /// Emit a named event without waiting for a reply
    pub fn transmit(&self, event: &str, data: Value) -> RtiResult<()> {
        self.inner.transport.transmit(event, data, None)
    }

    // === RPC ===

    /// Invoke a server method with callbacks
    ///
    /// A server-reported error goes to `on_error` when given, else it is
    /// emitted as an error event scoped `rpc:{method}`.
    pub fn invoke_with<F, E>(&self, method: &str, payload: Value, on_result: F, on_error: Option<E>) -> RtiResult<()>
    where
        F: FnOnce(Value) + Send + 'static,
        E: FnOnce(Value) + Send + 'static,
    {
        debug!(%method, "RtiClient::invoke_with: called");
        let weak = Arc::downgrade(&self.inner);
        let scope = format!("rpc:{}", method);
        self.inner.transport.transmit(
            method,
            payload,
            Some(Box::new(move |result| match result {
                Ok(data) => on_result(data),
                Err(error) => match on_error {
                    Some(on_error) => on_error(error),
                    None => {
                        if let Some(inner) = weak.upgrade() {
                            inner.events.error(&scope, error.to_string());
                        }
                    }
                },
            })),
        )
    }

    /// Invoke a server method and await its reply
    pub async fn invoke(&self, method: &str, payload: Value) -> RtiResult<Value> {
        debug!(%method, "RtiClient::invoke: called");
        let (tx, rx) = oneshot::channel();
        self.inner.transport.transmit(
            method,
            payload,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        )?;
        match rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(error)) => Err(RtiError::Rpc {
                method: method.to_string(),
                error,
            }),
            Err(_) => Err(RtiError::Connection("Reply channel closed".to_string())),
        }
    }

    /// Ask the broker whether `token` is valid
    pub async fn verify_token(&self, token: &str) -> RtiResult<Value> {
        self.invoke("verifytoken", json!(token)).await
    }

    // === Channel directory ===

    fn record_channel_usage(&self, channel: &str, publish: bool, data_type: &str) {
        let new_channel = self.inner.directory.write().record_usage(channel, publish, data_type);
        if let Some(channel) = new_channel {
            self.register_channel(channel);
        }
    }

    /// Register explicit channel metadata and announce it when connected
    pub fn register_channel(&self, channel: Channel) {
        debug!(channel = %channel.name, "RtiClient::register_channel: called");
        let merged = self.inner.directory.write().register_channel(channel);
        if let Some(merged) = merged
            && self.is_connected()
            && !self.inner.incognito
        {
            let message = proto::Channels::of(proto::channels::Which::Channel(merged));
            if let Err(e) = self.publish(channel::CHANNELS, &message) {
                warn!(error = %e, "Failed to announce channel");
            }
        }
    }

    pub fn unregister_channel(&self, channel: &str) {
        debug!(%channel, "RtiClient::unregister_channel: called");
        self.inner.directory.write().unregister_channel(channel);
    }

    pub fn known_channels(&self) -> HashMap<String, Channel> {
        self.inner.directory.read().known_channels.clone()
    }

    pub fn used_channels(&self) -> HashMap<String, ChannelUse> {
        self.inner.directory.read().used_channels.clone()
    }

    pub fn known_clients(&self) -> HashMap<String, Client> {
        self.inner.directory.read().known_clients.clone()
    }

    pub fn clients_by_application(&self, application: &str) -> Vec<Client> {
        self.inner.directory.read().clients_by_application(application)
    }

    pub fn known_measures(&self) -> HashMap<String, Measure> {
        self.inner.directory.read().known_measures.clone()
    }
}

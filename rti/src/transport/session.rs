//! TransportSession - one persistent socket carrying pub/sub, RPC and auth
//!
//! The session owns everything about the wire: the handshake and token
//! lifecycle, correlation ids and pending replies, the set of tracked
//! channels that is replayed after every handshake, and the single outbound
//! path into the I/O loop. The I/O loop itself lives in [`super::scheduler`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::envelope::{Envelope, Inbound, PONG};
use crate::error::{RtiError, RtiResult};

/// Connection lifecycle of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Socket open, handshake sent, no token yet
    AwaitingAuth,
    Authenticated,
}

/// Upward notifications from the session to the layer built on it
pub trait SessionObserver: Send + Sync {
    /// Socket opened, before the handshake is answered
    fn on_open(&self);
    /// Socket closed or dropped
    fn on_close(&self);
    /// Socket could not be opened or failed while open
    fn on_connection_error(&self, error: &RtiError);
    /// Broker answered the handshake
    fn on_auth_ack(&self, socket_id: &str, is_authenticated: bool);
    /// Session holds a valid token
    fn on_authenticated(&self);
    /// Token was cleared while the session was otherwise authenticated
    fn on_token_missing(&self);
    /// Inbound frame that could not be understood
    fn on_protocol_error(&self, error: &RtiError);
    /// Named server event with no registered listener
    fn on_unhandled_event(&self, name: &str, data: &Value);
}

/// Listener for deliveries on one wire channel: `(wire_channel, data)`
pub type ChannelListener = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Listener for a named server event; the result answers invocations carrying a `cid`
pub type EventListener = Arc<dyn Fn(&str, &Value) -> Result<Value, Value> + Send + Sync>;

/// Completion for an acknowledged operation: `Ok(data)` or `Err(error)`
pub type AckHandler = Box<dyn FnOnce(Result<Value, Value>) + Send>;

struct PendingRpc {
    label: String,
    handler: AckHandler,
}

/// Transport tuning
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub reconnect: bool,
    pub reconnect_delay: Duration,
    pub watchdog_tick: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_delay: Duration::from_secs(3),
            watchdog_tick: Duration::from_secs(1),
        }
    }
}

/// Framing and correlation over one socket
pub struct TransportSession {
    url: String,
    options: TransportOptions,
    state: RwLock<SessionState>,
    handshaken: AtomicBool,
    socket_id: RwLock<Option<String>>,
    auth_token: RwLock<Option<String>>,
    next_cid: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRpc>>,
    channels: Mutex<Vec<String>>,
    channel_listeners: RwLock<HashMap<String, ChannelListener>>,
    event_listeners: RwLock<HashMap<String, EventListener>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    observer: RwLock<Option<Weak<dyn SessionObserver>>>,
    reconnect: AtomicBool,
    pub(super) running: AtomicBool,
    pub(super) cancel: Mutex<CancellationToken>,
}

impl TransportSession {
    pub fn new(url: impl Into<String>, options: TransportOptions) -> Self {
        let url = url.into();
        debug!(%url, ?options, "TransportSession::new: called");
        Self {
            url,
            reconnect: AtomicBool::new(options.reconnect),
            options,
            state: RwLock::new(SessionState::Disconnected),
            handshaken: AtomicBool::new(false),
            socket_id: RwLock::new(None),
            auth_token: RwLock::new(None),
            next_cid: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(Vec::new()),
            channel_listeners: RwLock::new(HashMap::new()),
            event_listeners: RwLock::new(HashMap::new()),
            outbound: Mutex::new(None),
            observer: RwLock::new(None),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn set_observer(&self, observer: Weak<dyn SessionObserver>) {
        *self.observer.write() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn SessionObserver>> {
        self.observer.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub(super) fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = ?*current, to = ?state, "TransportSession: state change");
            *current = state;
        }
    }

    /// Socket currently open
    pub fn is_open(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// At least one handshake has been answered during this session's lifetime
    pub fn has_handshaken(&self) -> bool {
        self.handshaken.load(Ordering::SeqCst)
    }

    pub fn socket_id(&self) -> Option<String> {
        self.socket_id.read().clone()
    }

    pub fn auth_token(&self) -> Option<String> {
        self.auth_token.read().clone()
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write() = token;
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect.load(Ordering::SeqCst)
    }

    pub fn set_reconnect(&self, enable: bool) {
        self.reconnect.store(enable, Ordering::SeqCst);
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.options.reconnect_delay
    }

    pub(super) fn watchdog_tick(&self) -> Duration {
        self.options.watchdog_tick
    }

    pub(super) fn default_reconnect(&self) -> bool {
        self.options.reconnect
    }

    /// Channels replayed after every handshake, in subscription order
    pub fn tracked_channels(&self) -> Vec<String> {
        self.channels.lock().clone()
    }

    fn next_cid(&self) -> u64 {
        self.next_cid.fetch_add(1, Ordering::SeqCst) + 1
    }

    // === Listener registration ===

    /// Install the single listener for a wire channel, replacing any previous one
    pub fn on_channel(&self, channel: &str, listener: ChannelListener) {
        debug!(%channel, "TransportSession::on_channel: called");
        self.channel_listeners.write().insert(channel.to_string(), listener);
    }

    pub fn off_channel(&self, channel: &str) {
        debug!(%channel, "TransportSession::off_channel: called");
        self.channel_listeners.write().remove(channel);
    }

    pub fn on_event(&self, name: &str, listener: EventListener) {
        debug!(%name, "TransportSession::on_event: called");
        self.event_listeners.write().insert(name.to_string(), listener);
    }

    pub fn off_event(&self, name: &str) {
        self.event_listeners.write().remove(name);
    }

    // === Outbound operations ===

    fn send_text(&self, text: String) -> RtiResult<()> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(RtiError::Connection("Socket is not open".to_string()));
        };
        tx.send(Message::text(text))
            .map_err(|_| RtiError::Connection("Socket writer has stopped".to_string()))
    }

    /// Send an envelope, registering `ack` under the envelope's correlation id
    fn send_envelope(&self, envelope: Envelope, ack: Option<(String, AckHandler)>) -> RtiResult<()> {
        let cid = envelope.cid;
        let text = envelope.to_text()?;
        trace!(%text, "TransportSession: send");
        if let (Some(cid), Some((label, handler))) = (cid, ack) {
            self.pending.lock().insert(cid, PendingRpc { label, handler });
            if let Err(e) = self.send_text(text) {
                let pending = self.pending.lock().remove(&cid);
                if let Some(pending) = pending {
                    (pending.handler)(Err(json!(e.to_string())));
                }
                return Err(e);
            }
            return Ok(());
        }
        self.send_text(text)
    }

    /// Emit a named event; with `ack`, a correlation id is attached and the reply routed to it
    pub fn transmit(&self, event: &str, data: Value, ack: Option<AckHandler>) -> RtiResult<()> {
        debug!(%event, with_ack = ack.is_some(), "TransportSession::transmit: called");
        let cid = ack.as_ref().map(|_| self.next_cid());
        self.send_envelope(
            Envelope::event(event, data, cid),
            ack.map(|handler| (event.to_string(), handler)),
        )
    }

    /// Track a channel and subscribe to it now if the socket is open
    ///
    /// Tracked channels are replayed after every handshake, so subscribing
    /// while disconnected is not an error.
    pub fn subscribe(&self, channel: &str, ack: Option<AckHandler>) -> RtiResult<()> {
        debug!(%channel, "TransportSession::subscribe: called");
        {
            let mut channels = self.channels.lock();
            if !channels.iter().any(|c| c == channel) {
                channels.push(channel.to_string());
            }
        }
        if !self.is_open() {
            debug!(%channel, "TransportSession::subscribe: socket closed, deferring to next handshake");
            if let Some(handler) = ack {
                handler(Err(json!("Socket is not open")));
            }
            return Ok(());
        }
        let cid = self.next_cid();
        self.send_envelope(
            Envelope::subscribe(channel, cid),
            ack.map(|handler| (channel.to_string(), handler)),
        )
    }

    pub fn unsubscribe(&self, channel: &str, ack: Option<AckHandler>) -> RtiResult<()> {
        debug!(%channel, "TransportSession::unsubscribe: called");
        self.channels.lock().retain(|c| c != channel);
        if !self.is_open() {
            if let Some(handler) = ack {
                handler(Err(json!("Socket is not open")));
            }
            return Ok(());
        }
        let cid = self.next_cid();
        self.send_envelope(
            Envelope::unsubscribe(channel, cid),
            ack.map(|handler| (channel.to_string(), handler)),
        )
    }

    /// Publish on a wire channel
    ///
    /// Fails immediately if no handshake has ever succeeded; nothing is queued.
    pub fn publish(&self, channel: &str, data: &str, ack: Option<AckHandler>) -> RtiResult<()> {
        trace!(%channel, len = data.len(), "TransportSession::publish: called");
        if !self.has_handshaken() {
            return Err(RtiError::Precondition("Cannot publish before connected".to_string()));
        }
        let cid = self.next_cid();
        self.send_envelope(
            Envelope::publish(channel, data, cid),
            ack.map(|handler| (channel.to_string(), handler)),
        )
    }

    fn resubscribe_all(&self) {
        let channels = self.tracked_channels();
        debug!(count = channels.len(), "TransportSession: replaying subscriptions");
        for channel in channels {
            let cid = self.next_cid();
            if let Err(e) = self.send_envelope(Envelope::subscribe(&channel, cid), None) {
                warn!(%channel, error = %e, "Failed to replay subscription");
            }
        }
    }

    // === I/O loop callbacks ===

    /// Socket opened: install the writer and send the handshake
    pub(crate) fn opened(&self, tx: mpsc::UnboundedSender<Message>) {
        info!(url = %self.url, "Socket opened");
        self.next_cid.store(0, Ordering::SeqCst);
        *self.outbound.lock() = Some(tx);
        self.set_state(SessionState::AwaitingAuth);
        if let Some(observer) = self.observer() {
            observer.on_open();
        }
        let token = self.auth_token();
        let cid = self.next_cid();
        if let Err(e) = self.send_envelope(Envelope::handshake(token.as_deref(), cid), None) {
            warn!(error = %e, "Failed to send handshake");
        }
    }

    /// Socket closed: drop the writer and fail every outstanding reply
    pub(crate) fn closed(&self) {
        let was_open = self.outbound.lock().take().is_some();
        self.set_state(SessionState::Disconnected);
        *self.socket_id.write() = None;
        let pending: Vec<PendingRpc> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for rpc in pending {
            debug!(label = %rpc.label, "Failing outstanding reply on close");
            (rpc.handler)(Err(json!("Connection closed")));
        }
        if was_open {
            info!(url = %self.url, "Socket closed");
            if let Some(observer) = self.observer() {
                observer.on_close();
            }
        }
    }

    pub(crate) fn connection_failed(&self, error: RtiError) {
        warn!(url = %self.url, error = %error, "Connection error");
        if let Some(observer) = self.observer() {
            observer.on_connection_error(&error);
        }
    }

    /// Periodic check for a token cleared without notice
    pub(crate) fn check_token(&self) {
        if self.state() == SessionState::Authenticated && self.auth_token.read().is_none() {
            debug!("TransportSession: token missing while authenticated, resending credentials");
            if let Some(observer) = self.observer() {
                observer.on_token_missing();
            }
        }
    }

    /// Binary frames are not part of the protocol; report and drop
    pub(crate) fn handle_binary(&self, len: usize) {
        let error = RtiError::Protocol(format!("Unexpected binary frame of {} bytes", len));
        warn!(error = %error, "Dropping binary frame");
        if let Some(observer) = self.observer() {
            observer.on_protocol_error(&error);
        }
    }

    /// Decode and dispatch one inbound text frame
    pub(crate) fn handle_text(&self, text: &str) {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                if let Some(observer) = self.observer() {
                    observer.on_protocol_error(&e);
                }
                return;
            }
        };

        match inbound {
            Inbound::Ping => {
                if let Err(e) = self.send_text(PONG.to_string()) {
                    debug!(error = %e, "Failed to answer ping");
                }
            }
            Inbound::Empty => {
                let _ = self.send_text(String::new());
            }
            Inbound::Publish { channel, data } => {
                let listener = self.channel_listeners.read().get(&channel).cloned();
                match listener {
                    Some(listener) => listener(&channel, &data),
                    None => trace!(%channel, "Delivery on channel without listener"),
                }
            }
            Inbound::SetAuthToken { token } => {
                debug!("TransportSession: auth token set");
                self.set_auth_token(Some(token));
                self.set_state(SessionState::Authenticated);
                if let Some(observer) = self.observer() {
                    observer.on_authenticated();
                }
            }
            Inbound::RemoveAuthToken => {
                debug!("TransportSession: auth token removed");
                self.set_auth_token(None);
            }
            Inbound::AuthAck { id, is_authenticated } => {
                info!(socket_id = %id, is_authenticated, "Handshake acknowledged");
                *self.socket_id.write() = Some(id.clone());
                self.handshaken.store(true, Ordering::SeqCst);
                if let Some(observer) = self.observer() {
                    observer.on_auth_ack(&id, is_authenticated);
                }
                self.resubscribe_all();
                if is_authenticated && self.auth_token.read().is_some() {
                    self.set_state(SessionState::Authenticated);
                    if let Some(observer) = self.observer() {
                        observer.on_authenticated();
                    }
                }
            }
            Inbound::Event { name, data, cid } => {
                let listener = self.event_listeners.read().get(&name).cloned();
                match listener {
                    Some(listener) => {
                        let result = listener(&name, &data);
                        if let Some(cid) = cid
                            && let Err(e) = self.send_envelope(Envelope::reply(cid, result), None)
                        {
                            debug!(%name, error = %e, "Failed to answer server invocation");
                        }
                    }
                    None => {
                        debug!(%name, "Server event without listener");
                        if let Some(observer) = self.observer() {
                            observer.on_unhandled_event(&name, &data);
                        }
                    }
                }
            }
            Inbound::Reply { rid, data, error } => {
                let pending = self.pending.lock().remove(&rid);
                match pending {
                    Some(rpc) => {
                        trace!(rid, label = %rpc.label, "Reply matched");
                        let result = match error {
                            Some(error) => Err(error),
                            None => Ok(data),
                        };
                        (rpc.handler)(result);
                    }
                    None => trace!(rid, "Reply without pending handler"),
                }
            }
        }
    }

    /// Stop reconnecting and close the socket
    pub fn disconnect(&self) {
        debug!(url = %self.url, "TransportSession::disconnect: called");
        self.set_reconnect(false);
        self.cancel.lock().cancel();
    }

    /// Number of replies still outstanding
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn open_session() -> (TransportSession, mpsc::UnboundedReceiver<Message>) {
        let session = TransportSession::new("ws://test", TransportOptions::default());
        let (tx, rx) = mpsc::unbounded_channel();
        session.opened(tx);
        (session, rx)
    }

    fn next_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        let message = rx.try_recv().expect("expected outbound frame");
        serde_json::from_str(message.to_text().unwrap()).unwrap()
    }

    #[test]
    fn test_open_sends_handshake_with_cid_one() {
        let (_session, mut rx) = open_session();
        let frame = next_json(&mut rx);
        assert_eq!(frame["event"], "#handshake");
        assert_eq!(frame["cid"], 1);
        assert!(frame["data"]["authToken"].is_null());
    }

    #[test]
    fn test_publish_before_handshake_fails() {
        let (session, _rx) = open_session();
        let err = session.publish("foo", "bar", None).unwrap_err();
        assert!(matches!(err, RtiError::Precondition(_)));
    }

    #[test]
    fn test_auth_ack_replays_tracked_channels() {
        let session = TransportSession::new("ws://test", TransportOptions::default());
        session.subscribe("a", None).unwrap();
        session.subscribe("b", None).unwrap();
        session.subscribe("a", None).unwrap();
        assert_eq!(session.tracked_channels(), vec!["a", "b"]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.opened(tx);
        let _handshake = next_json(&mut rx);
        session.handle_text(r#"{"rid":1,"data":{"id":"s1","isAuthenticated":false}}"#);
        assert!(session.has_handshaken());
        assert_eq!(session.socket_id().as_deref(), Some("s1"));

        let first = next_json(&mut rx);
        let second = next_json(&mut rx);
        assert_eq!(first["event"], "#subscribe");
        assert_eq!(first["data"]["channel"], "a");
        assert_eq!(second["data"]["channel"], "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reply_dispatched_exactly_once() {
        let (session, mut rx) = open_session();
        let _handshake = next_json(&mut rx);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        session
            .transmit(
                "echo",
                json!("hi"),
                Some(Box::new(move |result| {
                    assert_eq!(result, Ok(json!("hi")));
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        let frame = next_json(&mut rx);
        let cid = frame["cid"].as_u64().unwrap();
        assert_eq!(session.pending_count(), 1);

        let reply = format!(r#"{{"rid":{},"data":"hi"}}"#, cid);
        session.handle_text(&reply);
        session.handle_text(&reply);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn test_correlation_ids_increase() {
        let (session, mut rx) = open_session();
        session.handle_text(r#"{"rid":1,"data":{"id":"s1","isAuthenticated":false}}"#);
        let _handshake = next_json(&mut rx);
        session.publish("x", "1", None).unwrap();
        session.publish("x", "2", None).unwrap();
        let a = next_json(&mut rx)["cid"].as_u64().unwrap();
        let b = next_json(&mut rx)["cid"].as_u64().unwrap();
        assert!(b > a);
        assert!(a > 1);
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (session, mut rx) = open_session();
        let _handshake = next_json(&mut rx);
        session.handle_text("#1");
        let message = rx.try_recv().unwrap();
        assert_eq!(message.to_text().unwrap(), "#2");
    }

    #[test]
    fn test_close_fails_outstanding_replies() {
        let (session, _rx) = open_session();
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        session
            .transmit(
                "slow",
                Value::Null,
                Some(Box::new(move |result| {
                    flag.store(result.is_err(), Ordering::SeqCst);
                })),
            )
            .unwrap();
        session.closed();
        assert!(failed.load(Ordering::SeqCst));
        assert!(!session.is_open());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_channel_delivery_reaches_listener() {
        let (session, _rx) = open_session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on_channel(
            "foo",
            Arc::new(move |channel, data| sink.lock().push(format!("{}={}", channel, data))),
        );
        session.handle_text(r##"{"event":"#publish","data":{"channel":"foo","data":"bar"}}"##);
        session.handle_text(r##"{"event":"#publish","data":{"channel":"other","data":"x"}}"##);
        assert_eq!(*seen.lock(), vec!["foo=bar".to_string()]);
    }

    #[test]
    fn test_server_invocation_answered() {
        let (session, mut rx) = open_session();
        let _handshake = next_json(&mut rx);
        session.on_event("double", Arc::new(|_, data| Ok(json!(data.as_i64().unwrap_or(0) * 2))));
        session.handle_text(r#"{"event":"double","data":21,"cid":5}"#);
        let reply = next_json(&mut rx);
        assert_eq!(reply["rid"], 5);
        assert_eq!(reply["data"], 42);
    }

    #[test]
    fn test_token_push_and_removal() {
        let (session, _rx) = open_session();
        session.handle_text(r##"{"event":"#setAuthToken","data":{"token":"abc"}}"##);
        assert_eq!(session.auth_token().as_deref(), Some("abc"));
        assert_eq!(session.state(), SessionState::Authenticated);
        session.handle_text(r##"{"event":"#removeAuthToken"}"##);
        assert_eq!(session.auth_token(), None);
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[test]
    fn test_unsubscribe_stops_tracking() {
        let session = TransportSession::new("ws://test", TransportOptions::default());
        session.subscribe("a", None).unwrap();
        session.unsubscribe("a", None).unwrap();
        assert!(session.tracked_channels().is_empty());
    }
}

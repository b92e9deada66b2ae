//! In-process broker speaking the bus wire protocol, for end-to-end tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use rti::{ClientConfig, ClientEvent, RtiClient};

/// Result of a broker-side RPC method
pub type MethodHandler = Box<dyn Fn(&Value) -> Result<Value, Value> + Send + Sync>;

struct Peer {
    tx: mpsc::UnboundedSender<Message>,
    channels: HashSet<String>,
    kill: CancellationToken,
}

#[derive(Default)]
struct BrokerState {
    peers: Mutex<HashMap<u64, Peer>>,
    methods: Mutex<HashMap<String, MethodHandler>>,
    subscribe_requests: Mutex<Vec<String>>,
    unsubscribe_requests: Mutex<Vec<String>>,
    connections: AtomicU64,
}

impl BrokerState {
    fn send(&self, peer: u64, value: Value) {
        if let Some(p) = self.peers.lock().get(&peer) {
            let _ = p.tx.send(Message::text(value.to_string()));
        }
    }

    fn reply(&self, peer: u64, cid: Option<u64>, result: Result<Value, Value>) {
        let Some(rid) = cid else {
            return;
        };
        let frame = match result {
            Ok(data) => json!({ "rid": rid, "data": data }),
            Err(error) => json!({ "rid": rid, "error": error }),
        };
        self.send(peer, frame);
    }

    fn handle(&self, peer: u64, text: &str) {
        if text == "#1" {
            self.send_raw(peer, "#2");
            return;
        }
        if text == "#2" || text.is_empty() {
            return;
        }
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let cid = frame["cid"].as_u64();
        let data = frame["data"].clone();
        match frame["event"].as_str().unwrap_or_default() {
            "#handshake" => self.reply(
                peer,
                cid,
                Ok(json!({ "id": format!("socket-{}", peer), "isAuthenticated": false })),
            ),
            "auth" => {
                self.send(
                    peer,
                    json!({ "event": "#setAuthToken", "data": { "token": format!("token-{}", peer) } }),
                );
                self.reply(peer, cid, Ok(Value::Null));
            }
            "#subscribe" => {
                let channel = data["channel"].as_str().unwrap_or_default().to_string();
                self.subscribe_requests.lock().push(channel.clone());
                if let Some(p) = self.peers.lock().get_mut(&peer) {
                    p.channels.insert(channel);
                }
                self.reply(peer, cid, Ok(Value::Null));
            }
            "#unsubscribe" => {
                let channel = data.as_str().unwrap_or_default().to_string();
                self.unsubscribe_requests.lock().push(channel.clone());
                if let Some(p) = self.peers.lock().get_mut(&peer) {
                    p.channels.remove(&channel);
                }
                self.reply(peer, cid, Ok(Value::Null));
            }
            "#publish" => {
                let channel = data["channel"].as_str().unwrap_or_default();
                let delivery = Message::text(json!({ "event": "#publish", "data": data }).to_string());
                for p in self.peers.lock().values().filter(|p| p.channels.contains(channel)) {
                    let _ = p.tx.send(delivery.clone());
                }
                self.reply(peer, cid, Ok(Value::Null));
            }
            "" => {}
            method => {
                let result = match self.methods.lock().get(method) {
                    Some(handler) => handler(&data),
                    None => Err(json!({ "name": "UnknownMethod", "message": method })),
                };
                self.reply(peer, cid, result);
            }
        }
    }

    fn send_raw(&self, peer: u64, text: &str) {
        if let Some(p) = self.peers.lock().get(&peer) {
            let _ = p.tx.send(Message::text(text));
        }
    }
}

/// A broker bound to an ephemeral localhost port
pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    shutdown: CancellationToken,
}

impl MockBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind broker");
        let addr = listener.local_addr().expect("broker address");
        let state = Arc::new(BrokerState::default());
        let shutdown = CancellationToken::new();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        tokio::spawn(serve(accept_state.clone(), stream, accept_shutdown.child_token()));
                    }
                }
            }
        });

        Self { addr, state, shutdown }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Client configuration pointing at this broker with a short reconnect delay
    pub fn config(&self, application: &str) -> ClientConfig {
        ClientConfig {
            url: self.url(),
            client_id: Some(format!("{}-id", application.to_lowercase())),
            host: Some("test-host".to_string()),
            reconnect_delay_ms: 100,
            ..ClientConfig::for_application(application)
        }
    }

    /// Register an RPC method answered by the broker
    pub fn method<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, Value> + Send + Sync + 'static,
    {
        self.state.methods.lock().insert(name.to_string(), Box::new(handler));
    }

    /// Close every open socket from the broker side
    pub fn drop_connections(&self) {
        for peer in self.state.peers.lock().values() {
            peer.kill.cancel();
        }
    }

    /// Sockets accepted since start
    pub fn connection_count(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Open sockets currently subscribed to a wire channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .peers
            .lock()
            .values()
            .filter(|p| p.channels.contains(channel))
            .count()
    }

    /// Every `#subscribe` received for a wire channel, across all sockets
    pub fn subscribe_requests(&self, channel: &str) -> usize {
        self.state.subscribe_requests.lock().iter().filter(|c| *c == channel).count()
    }

    pub fn unsubscribe_requests(&self, channel: &str) -> usize {
        self.state.unsubscribe_requests.lock().iter().filter(|c| *c == channel).count()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(state: Arc<BrokerState>, stream: TcpStream, shutdown: CancellationToken) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let id = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    state.peers.lock().insert(
        id,
        Peer {
            tx,
            channels: HashSet::new(),
            kill: kill.clone(),
        },
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = kill.cancelled() => break,
            outbound = rx.recv() => match outbound {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => state.handle(id, text.as_str()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.peers.lock().remove(&id);
    let _ = sink.send(Message::Close(None)).await;
}

/// Connect a client with the owned I/O task and wait for authentication
pub async fn connected_client(broker: &MockBroker, application: &str) -> RtiClient {
    let client = RtiClient::new(broker.config(application));
    client.connect().expect("connect");
    client
        .wait_until_connected(Duration::from_secs(5))
        .await
        .expect("client should connect to mock broker");
    client
}

/// Poll `condition` every 10ms for up to five seconds
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Route test logs through tracing when `RUST_LOG` is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Next connect or disconnect event, skipping errors and messages
pub async fn next_lifecycle(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Error { .. } | ClientEvent::Message { .. }) => continue,
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("lifecycle event within five seconds")
}

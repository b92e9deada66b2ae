//! I/O scheduling for the transport session
//!
//! A session is driven in one of two ways: an owned background task spawned
//! on the current tokio runtime, or a caller-driven main loop that invokes an
//! idle callback between socket reads. Both run the same loop: connect,
//! service the socket until it closes, wait a flat delay, reconnect.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{SessionState, TransportSession};
use crate::error::{RtiError, RtiResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How socket I/O is driven
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SchedulingStrategy {
    /// The client spawns its own I/O task on connect
    #[default]
    OwnedThread,
    /// The caller drives I/O through `run_main_loop`, with an idle callback
    /// invoked at most every `idle_interval_ms`
    ExternalLoop {
        #[serde(rename = "idle-interval-ms")]
        idle_interval_ms: u64,
    },
}

impl SchedulingStrategy {
    pub fn is_owned(&self) -> bool {
        matches!(self, SchedulingStrategy::OwnedThread)
    }

    pub fn idle_interval(&self) -> Option<Duration> {
        match self {
            SchedulingStrategy::OwnedThread => None,
            SchedulingStrategy::ExternalLoop { idle_interval_ms } => {
                Some(Duration::from_millis((*idle_interval_ms).max(1)))
            }
        }
    }
}

/// Idle callback plus its interval and next due time
struct MainLoop<F> {
    callback: F,
    interval: Duration,
    due: Instant,
}

impl<F: FnMut()> MainLoop<F> {
    fn new(callback: F, interval: Duration) -> Self {
        Self {
            callback,
            interval,
            due: Instant::now(),
        }
    }

    fn tick(&mut self) {
        (self.callback)();
        self.due = Instant::now() + self.interval;
    }
}

fn idle_due<F>(main_loop: &Option<MainLoop<F>>) -> Instant {
    main_loop
        .as_ref()
        .map(|m| m.due)
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
}

/// Spawn the owned I/O task unless one is already running
///
/// Calling this repeatedly while a connection attempt is in flight is a no-op.
pub fn spawn_owned(session: &Arc<TransportSession>) {
    if session.running.swap(true, Ordering::SeqCst) {
        debug!("spawn_owned: I/O task already running");
        return;
    }
    session.set_reconnect(session.default_reconnect());
    let cancel = CancellationToken::new();
    *session.cancel.lock() = cancel.clone();

    let session = Arc::clone(session);
    tokio::spawn(async move {
        run::<fn()>(&session, cancel, None).await;
        session.running.store(false, Ordering::SeqCst);
        debug!("spawn_owned: I/O task exited");
    });
}

/// Drive the session from the calling task, invoking `callback` when idle
///
/// Returns once the session is disconnected and reconnection is disabled.
pub async fn drive_external<F: FnMut()>(
    session: &Arc<TransportSession>,
    callback: F,
    idle_interval: Duration,
) -> RtiResult<()> {
    if session.running.swap(true, Ordering::SeqCst) {
        return Err(RtiError::Precondition("Session I/O is already being driven".to_string()));
    }
    session.set_reconnect(session.default_reconnect());
    let cancel = CancellationToken::new();
    *session.cancel.lock() = cancel.clone();

    run(session, cancel, Some(MainLoop::new(callback, idle_interval))).await;
    session.running.store(false, Ordering::SeqCst);
    Ok(())
}

async fn run<F: FnMut()>(session: &Arc<TransportSession>, cancel: CancellationToken, mut main_loop: Option<MainLoop<F>>) {
    info!(url = %session.url(), "Transport loop starting");
    'outer: loop {
        if cancel.is_cancelled() {
            break;
        }
        session.set_state(SessionState::Connecting);

        let connecting = connect_async(session.url().to_string());
        tokio::pin!(connecting);
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                result = &mut connecting => break result,
                _ = sleep_until(idle_due(&main_loop)), if main_loop.is_some() => {
                    if let Some(m) = main_loop.as_mut() {
                        m.tick();
                    }
                }
            }
        };

        match result {
            Ok((socket, _response)) => {
                service(session, socket, &cancel, &mut main_loop).await;
            }
            Err(e) => {
                session.set_state(SessionState::Disconnected);
                session.connection_failed(RtiError::Connection(e.to_string()));
            }
        }

        if cancel.is_cancelled() || !session.reconnect_enabled() {
            break;
        }

        let delay = session.reconnect_delay();
        debug!(?delay, "Transport loop: reconnecting after delay");
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                _ = sleep_until(deadline) => break,
                _ = sleep_until(idle_due(&main_loop)), if main_loop.is_some() => {
                    if let Some(m) = main_loop.as_mut() {
                        m.tick();
                    }
                }
            }
        }
    }
    session.set_state(SessionState::Disconnected);
    info!(url = %session.url(), "Transport loop stopped");
}

/// Service one open socket until it closes or the session is cancelled
async fn service<F: FnMut()>(
    session: &Arc<TransportSession>,
    socket: Socket,
    cancel: &CancellationToken,
    main_loop: &mut Option<MainLoop<F>>,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    session.opened(tx);

    let mut watchdog = tokio::time::interval(session.watchdog_tick());
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    debug!("service: socket closed by peer");
                    break;
                }
                Some(Ok(Message::Binary(data))) => session.handle_binary(data.len()),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    session.connection_failed(RtiError::Connection(e.to_string()));
                    break;
                }
            },
            Some(message) = rx.recv() => {
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "service: write failed");
                    session.connection_failed(RtiError::Connection(e.to_string()));
                    break;
                }
            }
            _ = watchdog.tick() => session.check_token(),
            _ = sleep_until(idle_due(main_loop)), if main_loop.is_some() => {
                if let Some(m) = main_loop.as_mut() {
                    m.tick();
                }
            }
        }
    }
    session.closed();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategy_is_owned() {
        assert!(SchedulingStrategy::default().is_owned());
        assert_eq!(SchedulingStrategy::OwnedThread.idle_interval(), None);
    }

    #[test]
    fn test_external_loop_interval() {
        let strategy = SchedulingStrategy::ExternalLoop { idle_interval_ms: 50 };
        assert!(!strategy.is_owned());
        assert_eq!(strategy.idle_interval(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_strategy_from_yaml() {
        let strategy: SchedulingStrategy = serde_yaml::from_str("kind: external-loop\nidle-interval-ms: 20\n").unwrap();
        assert_eq!(strategy, SchedulingStrategy::ExternalLoop { idle_interval_ms: 20 });
        let strategy: SchedulingStrategy = serde_yaml::from_str("kind: owned-thread\n").unwrap();
        assert_eq!(strategy, SchedulingStrategy::OwnedThread);
    }

    #[tokio::test]
    async fn test_external_loop_calls_back_while_unreachable() {
        use crate::transport::TransportOptions;
        use std::sync::atomic::AtomicUsize;

        let options = TransportOptions {
            reconnect: true,
            reconnect_delay: Duration::from_millis(200),
            watchdog_tick: Duration::from_secs(1),
        };
        // Port 9 (discard) on loopback refuses connections
        let session = Arc::new(TransportSession::new("ws://127.0.0.1:9/", options));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let stopper = session.clone();

        let driver = {
            let session = session.clone();
            tokio::spawn(async move {
                drive_external(
                    &session,
                    move || {
                        if counter.fetch_add(1, Ordering::SeqCst) >= 3 {
                            stopper.disconnect();
                        }
                    },
                    Duration::from_millis(10),
                )
                .await
            })
        };

        let result = tokio::time::timeout(Duration::from_secs(5), driver).await;
        assert!(result.is_ok(), "external loop should stop after disconnect");
        assert!(calls.load(Ordering::SeqCst) >= 4);
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}

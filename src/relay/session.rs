use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::signer::Event;

/// Delay between reconnection attempts. Attempts never overlap; a new timer
/// is armed only after the previous session fully closes.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long a publish waits for the relay's `OK` before resolving false.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Session lifecycle, observable for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Closed,
    Destroyed,
}

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;
const STATE_DESTROYED: u8 = 3;

enum Command {
    Publish {
        event: Event,
        ack: oneshot::Sender<bool>,
    },
    Query {
        filter: Value,
        events: mpsc::UnboundedSender<Event>,
    },
}

struct PendingAck {
    ack: oneshot::Sender<bool>,
    expires: Instant,
}

/// A persistent, self-healing outbound session to one discovery relay.
pub struct RelaySession {
    url: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: StdMutex<Option<mpsc::UnboundedReceiver<Command>>>,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
}

impl RelaySession {
    pub fn new(url: impl Into<String>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            cmd_tx,
            cmd_rx: StdMutex::new(Some(cmd_rx)),
            cancel: CancellationToken::new(),
            state: Arc::new(AtomicU8::new(STATE_CLOSED)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Relaxed) {
            STATE_CONNECTING => SessionState::Connecting,
            STATE_CONNECTED => SessionState::Connected,
            STATE_DESTROYED => SessionState::Destroyed,
            _ => SessionState::Closed,
        }
    }

    /// Starts the session task. Idempotent; later calls are no-ops.
    pub fn connect(&self) {
        let Some(cmd_rx) = self
            .cmd_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let url = self.url.clone();
        let cancel = self.cancel.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(run_loop(url, cmd_rx, cancel, state));
    }

    /// Publishes one event. Resolves true iff this relay acknowledged it
    /// within [`PUBLISH_TIMEOUT`]; disconnects and timeouts resolve false.
    pub async fn publish(&self, event: Event) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Publish {
                event,
                ack: ack_tx,
            })
            .is_err()
        {
            return false;
        }
        match tokio::time::timeout(PUBLISH_TIMEOUT, ack_rx).await {
            Ok(Ok(accepted)) => accepted,
            _ => false,
        }
    }

    /// Subscribes with `filter` and yields matching events. The stream ends
    /// when the relay signals `EOSE` (or the session drops).
    pub fn query(&self, filter: Value) -> mpsc::UnboundedReceiver<Event> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(Command::Query {
            filter,
            events: events_tx,
        });
        events_rx
    }

    /// Destroys the session: cancels any reconnect and resolves every
    /// pending publish as false.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

fn set_state(state: &AtomicU8, value: u8) {
    state.store(value, Ordering::Relaxed);
}

async fn run_loop(
    url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        set_state(&state, STATE_CONNECTING);
        let connected = tokio::select! {
            () = cancel.cancelled() => break,
            result = connect_async(&url) => result,
        };
        match connected {
            Ok((stream, _response)) => {
                set_state(&state, STATE_CONNECTED);
                tracing::debug!(relay = %url, "Relay session connected");
                let commands_open = serve_connection(&url, stream, &mut cmd_rx, &cancel).await;
                set_state(&state, STATE_CLOSED);
                if !commands_open {
                    break;
                }
            }
            Err(err) => {
                set_state(&state, STATE_CLOSED);
                tracing::warn!(relay = %url, error = %err, "Relay connection failed");
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        tracing::debug!(relay = %url, delay_secs = RECONNECT_DELAY.as_secs(), "Scheduling relay reconnect");
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }

    // Destroyed: anything still queued resolves as failed.
    cmd_rx.close();
    while let Ok(command) = cmd_rx.try_recv() {
        if let Command::Publish { ack, .. } = command {
            let _ = ack.send(false);
        }
    }
    set_state(&state, STATE_DESTROYED);
    tracing::debug!(relay = %url, "Relay session destroyed");
}

/// Serves one live connection until it drops. Returns false when the command
/// channel itself closed (the session handle is gone).
async fn serve_connection(
    url: &str,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    cancel: &CancellationToken,
) -> bool {
    let (mut ws_tx, mut ws_rx): (WsSink, WsSource) = stream.split();
    let mut pending_acks: HashMap<String, PendingAck> = HashMap::new();
    let mut subs: HashMap<String, mpsc::UnboundedSender<Event>> = HashMap::new();
    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let commands_open = loop {
        tokio::select! {
            () = cancel.cancelled() => break true,
            command = cmd_rx.recv() => {
                let Some(command) = command else { break false };
                match command {
                    Command::Publish { event, ack } => {
                        let event_id = event.id.clone();
                        let frame = serde_json::json!(["EVENT", event]).to_string();
                        if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                            let _ = ack.send(false);
                            break true;
                        }
                        pending_acks.insert(
                            event_id,
                            PendingAck {
                                ack,
                                expires: Instant::now() + PUBLISH_TIMEOUT,
                            },
                        );
                    }
                    Command::Query { filter, events } => {
                        let sub_id = Uuid::new_v4().simple().to_string();
                        let frame = serde_json::json!(["REQ", sub_id, filter]).to_string();
                        if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                            break true;
                        }
                        subs.insert(sub_id, events);
                    }
                }
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                let expired: Vec<String> = pending_acks
                    .iter()
                    .filter(|(_, pending)| now >= pending.expires)
                    .map(|(id, _)| id.clone())
                    .collect();
                for event_id in expired {
                    if let Some(pending) = pending_acks.remove(&event_id) {
                        tracing::debug!(relay = %url, %event_id, "Publish timed out waiting for OK");
                        let _ = pending.ack.send(false);
                    }
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(message)) => {
                        if message.is_close() {
                            break true;
                        }
                        let Ok(text) = message.to_text() else { continue };
                        handle_frame(url, text, &mut pending_acks, &mut subs, &mut ws_tx).await;
                    }
                    Some(Err(err)) => {
                        tracing::debug!(relay = %url, error = %err, "Relay read error");
                        break true;
                    }
                    None => break true,
                }
            }
        }
    };

    // The connection is gone: every outstanding publish resolves false and
    // every open query stream ends.
    for (_, pending) in pending_acks.drain() {
        let _ = pending.ack.send(false);
    }
    subs.clear();
    commands_open
}

async fn handle_frame(
    url: &str,
    text: &str,
    pending_acks: &mut HashMap<String, PendingAck>,
    subs: &mut HashMap<String, mpsc::UnboundedSender<Event>>,
    ws_tx: &mut WsSink,
) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let Some(frame) = value.as_array() else {
        return;
    };
    match frame.first().and_then(Value::as_str) {
        Some("OK") => {
            let Some(event_id) = frame.get(1).and_then(Value::as_str) else {
                return;
            };
            let accepted = frame.get(2).and_then(Value::as_bool).unwrap_or(false);
            if let Some(pending) = pending_acks.remove(event_id) {
                let _ = pending.ack.send(accepted);
            }
        }
        Some("EVENT") => {
            let Some(sub_id) = frame.get(1).and_then(Value::as_str) else {
                return;
            };
            let Some(raw) = frame.get(2) else { return };
            // Individual events that fail to parse are skipped silently.
            let Ok(event) = serde_json::from_value::<Event>(raw.clone()) else {
                return;
            };
            if let Some(sender) = subs.get(sub_id) {
                let _ = sender.send(event);
            }
        }
        Some("EOSE") => {
            let Some(sub_id) = frame.get(1).and_then(Value::as_str) else {
                return;
            };
            if subs.remove(sub_id).is_some() {
                let close = serde_json::json!(["CLOSE", sub_id]).to_string();
                let _ = ws_tx.send(WsMessage::Text(close.into())).await;
            }
        }
        Some("NOTICE") => {
            tracing::debug!(relay = %url, notice = ?frame.get(1), "Relay notice");
        }
        // Unrelated frames (auth prompts, unsolicited events) are ignored.
        _ => {}
    }
}

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{error, info, warn};

use crate::protocol::{BackendMessage, ClientCommand, TransportEvent};

type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const COMMAND_QUEUE: usize = 16;
const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
}

/// Handle onto the backend link. Sending never fails from the caller's
/// point of view: messages submitted while the link is down are logged
/// and dropped, never queued for later.
#[derive(Clone)]
pub struct TransportHandle {
    pub(crate) commands: mpsc::Sender<ClientCommand>,
    pub(crate) events: broadcast::Sender<TransportEvent>,
    pub(crate) connected: watch::Receiver<bool>,
}

impl TransportHandle {
    pub async fn send(&self, command: ClientCommand) {
        if self.commands.send(command).await.is_err() {
            warn!("transport task stopped, dropping message");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub async fn wait_connected(&self) {
        let mut connected = self.connected.clone();
        let _ = connected.wait_for(|ready| *ready).await;
    }
}

pub fn spawn(config: TransportConfig, shutdown: watch::Receiver<bool>) -> TransportHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, _) = broadcast::channel(EVENT_QUEUE);
    let (connected_tx, connected_rx) = watch::channel(false);
    let handle = TransportHandle {
        commands: command_tx,
        events: event_tx.clone(),
        connected: connected_rx,
    };
    tokio::spawn(run(config, command_rx, event_tx, connected_tx, shutdown));
    handle
}

enum Phase {
    Session(Box<BackendStream>),
    Retry,
    Stop,
}

enum SessionEnd {
    Closed,
    Shutdown,
}

async fn run(
    config: TransportConfig,
    mut commands: mpsc::Receiver<ClientCommand>,
    events: broadcast::Sender<TransportEvent>,
    connected_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match connect_phase(&config, &mut commands, &events, &mut shutdown).await {
            Phase::Session(stream) => {
                let _ = connected_tx.send(true);
                let _ = events.send(TransportEvent::Connected);
                info!("connected to backend");
                let end = session(*stream, &mut commands, &events, &mut shutdown).await;
                let _ = connected_tx.send(false);
                let _ = events.send(TransportEvent::Disconnected);
                info!("backend connection closed");
                if matches!(end, SessionEnd::Shutdown) {
                    break;
                }
            }
            Phase::Retry => {}
            Phase::Stop => break,
        }
        if !retry_wait(config.retry_interval, &mut commands, &mut shutdown).await {
            break;
        }
    }
    info!("transport task stopped");
}

/// One connection attempt. Commands arriving while the attempt is in
/// flight are dropped so nothing stale is delivered once the link opens.
async fn connect_phase(
    config: &TransportConfig,
    commands: &mut mpsc::Receiver<ClientCommand>,
    events: &broadcast::Sender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Phase {
    info!(url = %config.url, "connecting to backend");
    let mut attempt = Box::pin(tokio::time::timeout(
        config.connect_timeout,
        connect_async(config.url.as_str()),
    ));
    loop {
        tokio::select! {
            result = &mut attempt => {
                return match result {
                    Ok(Ok((stream, _response))) => Phase::Session(Box::new(stream)),
                    Ok(Err(err)) => {
                        warn!(error = %err, "backend connection failed");
                        let _ = events.send(TransportEvent::Error {
                            message: err.to_string(),
                        });
                        Phase::Retry
                    }
                    Err(_) => {
                        warn!("backend connection timed out");
                        let _ = events.send(TransportEvent::Error {
                            message: "connection timed out".to_string(),
                        });
                        Phase::Retry
                    }
                };
            }
            command = commands.recv() => match command {
                Some(command) => drop_unsent(&command),
                None => return Phase::Stop,
            },
            _ = shutdown.changed() => return Phase::Stop,
        }
    }
}

async fn session(
    stream: BackendStream,
    commands: &mut mpsc::Receiver<ClientCommand>,
    events: &broadcast::Sender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut sink, mut frames) = stream.split();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            command = commands.recv() => match command {
                Some(command) => {
                    let payload = match serde_json::to_string(&command) {
                        Ok(payload) => payload,
                        Err(err) => {
                            error!(error = %err, "failed to serialize command");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::text(payload)).await {
                        warn!(error = %err, "failed to send command");
                        let _ = events.send(TransportEvent::Error {
                            message: err.to_string(),
                        });
                        return SessionEnd::Closed;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(raw))) => dispatch_frame(raw.as_str(), events),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) => return SessionEnd::Closed,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "websocket error");
                    let _ = events.send(TransportEvent::Error {
                        message: err.to_string(),
                    });
                    return SessionEnd::Closed;
                }
                None => return SessionEnd::Closed,
            },
        }
    }
}

/// Fixed-interval wait before the next connection attempt, still draining
/// and dropping whatever callers try to send meanwhile.
async fn retry_wait(
    interval: Duration,
    commands: &mut mpsc::Receiver<ClientCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(command) => drop_unsent(&command),
                None => return false,
            },
            _ = shutdown.changed() => return false,
        }
    }
}

fn drop_unsent(command: &ClientCommand) {
    warn!(command = ?command, "backend not connected, dropping message");
}

const KNOWN_TAGS: [&str; 7] = [
    "connection",
    "status",
    "transcription",
    "intent",
    "result",
    "speech",
    "error",
];

#[derive(Debug)]
enum FrameDecode {
    Message(BackendMessage),
    UnknownTag(String),
    Malformed(String),
}

/// Distinguishes an unknown `type` tag from a frame that is outright
/// unparseable. Both are discarded, but they log differently.
fn decode_frame(raw: &str) -> FrameDecode {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => return FrameDecode::Malformed(err.to_string()),
    };
    let tag = value
        .get("type")
        .and_then(|tag| tag.as_str())
        .unwrap_or_default()
        .to_string();
    if tag.is_empty() {
        return FrameDecode::Malformed("missing message type".to_string());
    }
    match serde_json::from_value::<BackendMessage>(value) {
        Ok(message) => FrameDecode::Message(message),
        Err(err) if KNOWN_TAGS.contains(&tag.as_str()) => FrameDecode::Malformed(err.to_string()),
        Err(_) => FrameDecode::UnknownTag(tag),
    }
}

fn dispatch_frame(raw: &str, events: &broadcast::Sender<TransportEvent>) {
    match decode_frame(raw) {
        FrameDecode::Message(message) => {
            let _ = events.send(TransportEvent::Message(message));
        }
        FrameDecode::UnknownTag(tag) => {
            warn!(tag = %tag, "unknown message type, discarding");
        }
        FrameDecode::Malformed(error) => {
            warn!(error = %error, "unparseable backend frame, discarding");
        }
    }
}

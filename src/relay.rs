//! Websocket relay transport.
//!
//! The relay is a dumb fan-out: after the register handshake it forwards
//! every broadcast to all registered clients, the sender included. This
//! module owns the socket and splits it three ways: a writer task fed by
//! an outbound channel, a reader task translating frames into loop
//! events, and a heartbeat task pinging every 30 s.
//!
//! Ordering per sender is preserved by the relay; there is no delivery
//! guarantee or retry. Transport loss is reported once as
//! `Event::TransportLost` and the tasks wind down.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::signaling::{ClientFrame, Identity, ServerFrame, SignalingEnvelope};
use crate::state_machine::Event;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum RelayError {
    ConnectionFailed(String),
    ConnectionTimeout,
    Closed,
    Serialization(serde_json::Error),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::ConnectionFailed(e) => write!(f, "relay connection failed: {}", e),
            RelayError::ConnectionTimeout => write!(f, "relay connection timed out"),
            RelayError::Closed => write!(f, "relay connection closed"),
            RelayError::Serialization(e) => write!(f, "frame serialization failed: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

/// Handle to a live relay session. Dropping it aborts the socket tasks.
pub struct RelayHandle {
    outbound: mpsc::Sender<ClientFrame>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl RelayHandle {
    /// Queue a frame for the writer task.
    pub async fn send_frame(&self, frame: ClientFrame) -> Result<(), RelayError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RelayError::Closed)
    }

    /// Fan an envelope out to every peer on the channel.
    pub async fn broadcast(&self, payload: SignalingEnvelope) -> Result<(), RelayError> {
        self.send_frame(ClientFrame::Broadcast { payload }).await
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
        self.heartbeat.abort();
    }
}

/// Connect, then run the register/getPeers handshake in the background.
/// Inbound signaling and roster snapshots arrive on `events`.
pub async fn connect(
    url: &str,
    identity: Identity,
    channel: String,
    events: mpsc::Sender<Event>,
) -> Result<RelayHandle, RelayError> {
    info!("connecting to relay at {}", url);

    let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| RelayError::ConnectionTimeout)?
        .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;

    info!("relay websocket established");
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (outbound, mut outbound_rx) = mpsc::channel::<ClientFrame>(100);

    let writer_events = events.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    warn!("dropping unserializable frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                warn!("relay write failed: {}", e);
                let _ = writer_events.send(Event::TransportLost).await;
                break;
            }
        }
    });

    let reader_outbound = outbound.clone();
    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        while let Some(message) = ws_rx.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("relay read failed: {}", e);
                    break;
                }
            };

            let frame: ServerFrame = match serde_json::from_str(&text) {
                Ok(f) => f,
                Err(e) => {
                    debug!("unparseable relay frame dropped: {}", e);
                    continue;
                }
            };

            match frame {
                ServerFrame::Welcome => {
                    let register = ClientFrame::Register {
                        address: identity.node_id.clone(),
                        nickname: identity.nickname.clone(),
                        channel: channel.clone(),
                        mode: "voice-chat".to_string(),
                        capabilities: vec![
                            "voice".to_string(),
                            "chat".to_string(),
                            "call".to_string(),
                        ],
                    };
                    if reader_outbound.send(register).await.is_err() {
                        break;
                    }
                }
                ServerFrame::Registered => {
                    info!("registered with relay as {}", identity.nickname);
                    let _ = reader_events
                        .send(Event::Message(format!(
                            "Connected to relay as {}",
                            identity.nickname
                        )))
                        .await;
                    if reader_outbound.send(ClientFrame::GetPeers).await.is_err() {
                        break;
                    }
                }
                ServerFrame::PeerList { peers } | ServerFrame::PeerListUpdate { peers } => {
                    if reader_events
                        .send(Event::RosterReplaced(peers))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                ServerFrame::Broadcast { payload } | ServerFrame::NodeMessage { payload } => {
                    if reader_events
                        .send(Event::EnvelopeReceived(payload))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                ServerFrame::Error { message } => {
                    warn!("relay error: {}", message);
                }
                ServerFrame::Unknown => {
                    debug!("unrecognized relay frame dropped");
                }
            }
        }
        let _ = reader_events.send(Event::TransportLost).await;
    });

    let heartbeat_outbound = outbound.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // first tick is immediate
        loop {
            ticker.tick().await;
            if heartbeat_outbound.send(ClientFrame::Ping).await.is_err() {
                break;
            }
        }
    });

    Ok(RelayHandle {
        outbound,
        writer,
        reader,
        heartbeat,
    })
}

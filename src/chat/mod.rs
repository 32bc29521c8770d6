//! Realtime chat transport.
//!
//! One WebSocket connection against the marketplace origin carries every
//! job room. The transport task owns the socket and the set of joined
//! rooms; the dispatcher talks to it through a [`ChatHandle`] and receives
//! inbound buyer turns on an mpsc channel. Disconnects reconnect with a
//! 2-second backoff and every tracked room is rejoined on reconnect.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::ChatError;
use crate::market::MarketClient;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Inbound events surfaced to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Confirmation that a room was joined.
    Joined { job_id: String },
    /// A chat message in a job room (buyer or self-originated).
    Message {
        job_id: String,
        sender: String,
        content: String,
    },
}

#[derive(Debug)]
enum Outbound {
    Join { job_id: String },
    Message { job_id: String, content: String },
}

/// Wire frames. The transport speaks JSON text frames tagged by `type`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    JoinJob {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    Joined {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    Message {
        #[serde(rename = "jobId")]
        job_id: String,
        #[serde(rename = "senderVerusId")]
        sender_verus_id: String,
        content: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

/// Cloneable handle for joining rooms and sending replies.
#[derive(Clone)]
pub struct ChatHandle {
    tx: mpsc::Sender<Outbound>,
}

impl ChatHandle {
    /// Join (or re-join) a job room.
    pub async fn join(&self, job_id: &str) -> Result<(), ChatError> {
        self.tx
            .send(Outbound::Join {
                job_id: job_id.to_string(),
            })
            .await
            .map_err(|_| ChatError::Disconnected {
                reason: "transport task gone".to_string(),
            })
    }

    /// Send a message into a job room.
    pub async fn send(&self, job_id: &str, content: &str) -> Result<(), ChatError> {
        self.tx
            .send(Outbound::Message {
                job_id: job_id.to_string(),
                content: content.to_string(),
            })
            .await
            .map_err(|_| ChatError::SendFailed {
                job_id: job_id.to_string(),
                reason: "transport task gone".to_string(),
            })
    }
}

/// Spawn the transport task.
///
/// `client` provides the chat token and session cookie for the handshake;
/// the WebSocket endpoint is derived from the marketplace origin.
pub fn spawn(
    client: Arc<MarketClient>,
    api_base: &str,
) -> (ChatHandle, mpsc::Receiver<ChatEvent>) {
    let (out_tx, out_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(256);
    let ws_base = websocket_base(api_base);

    tokio::spawn(transport_task(client, ws_base, out_rx, event_tx));

    (ChatHandle { tx: out_tx }, event_rx)
}

fn websocket_base(api_base: &str) -> String {
    if let Some(rest) = api_base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{api_base}")
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn transport_task(
    client: Arc<MarketClient>,
    ws_base: String,
    mut out_rx: mpsc::Receiver<Outbound>,
    event_tx: mpsc::Sender<ChatEvent>,
) {
    let mut rooms: HashSet<String> = HashSet::new();

    loop {
        match connect(&client, &ws_base).await {
            Ok(ws) => {
                tracing::info!(rooms = rooms.len(), "Chat transport connected");
                let closed =
                    run_connection(ws, &mut rooms, &mut out_rx, &event_tx).await;
                if closed {
                    tracing::debug!("Chat transport shut down (handle dropped)");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Chat transport connect failed");
            }
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

async fn connect(client: &MarketClient, ws_base: &str) -> Result<WsStream, ChatError> {
    let token = client
        .chat_token()
        .await
        .map_err(|e| ChatError::ConnectFailed {
            reason: e.to_string(),
        })?;

    let url = format!("{ws_base}/chat/socket?token={token}");
    let mut request = url
        .into_client_request()
        .map_err(|e| ChatError::ConnectFailed {
            reason: e.to_string(),
        })?;

    if let Some(cookie) = client.session_cookie().await {
        let value = HeaderValue::from_str(&cookie).map_err(|e| ChatError::ConnectFailed {
            reason: e.to_string(),
        })?;
        request.headers_mut().insert("Cookie", value);
    }

    let (ws, _) = connect_async(request)
        .await
        .map_err(|e| ChatError::ConnectFailed {
            reason: e.to_string(),
        })?;
    Ok(ws)
}

/// Drive one connection until it drops. Returns `true` when the outbound
/// channel is closed (dispatcher gone) and the task should exit for good.
async fn run_connection(
    ws: WsStream,
    rooms: &mut HashSet<String>,
    out_rx: &mut mpsc::Receiver<Outbound>,
    event_tx: &mpsc::Sender<ChatEvent>,
) -> bool {
    let (mut write, mut read) = ws.split();

    // Rejoin every tracked room after a reconnect.
    for job_id in rooms.iter() {
        let frame = Frame::JoinJob {
            job_id: job_id.clone(),
        };
        if send_frame(&mut write, &frame).await.is_err() {
            return false;
        }
    }

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(outbound) = outbound else {
                    return true;
                };
                let frame = match outbound {
                    Outbound::Join { job_id } => {
                        rooms.insert(job_id.clone());
                        Frame::JoinJob { job_id }
                    }
                    Outbound::Message { job_id, content } => Frame::Message {
                        job_id,
                        sender_verus_id: String::new(),
                        content,
                    },
                };
                if let Err(e) = send_frame(&mut write, &frame).await {
                    tracing::warn!(error = %e, "Chat send failed, reconnecting");
                    return false;
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_frame(&text) {
                            if event_tx.send(event).await.is_err() {
                                return true;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::warn!("Chat transport closed by peer");
                        return false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Chat transport read error");
                        return false;
                    }
                }
            }
        }
    }
}

async fn send_frame(
    write: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    frame: &Frame,
) -> Result<(), ChatError> {
    let text = serde_json::to_string(frame).map_err(|e| ChatError::InvalidEvent(e.to_string()))?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| ChatError::Disconnected {
            reason: e.to_string(),
        })
}

fn parse_frame(text: &str) -> Option<ChatEvent> {
    match serde_json::from_str::<Frame>(text) {
        Ok(Frame::Joined { job_id }) => Some(ChatEvent::Joined { job_id }),
        Ok(Frame::Message {
            job_id,
            sender_verus_id,
            content,
        }) => Some(ChatEvent::Message {
            job_id,
            sender: sender_verus_id,
            content,
        }),
        Ok(Frame::Error { message }) => {
            tracing::warn!(message, "Chat transport error event");
            None
        }
        Ok(Frame::JoinJob { .. }) => None,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unparseable chat frame");
            None
        }
    }
}

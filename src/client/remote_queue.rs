use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::QueuedEntry;
use crate::broker::queue::AckOutcome;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::{BrokerError, Result};
use crate::worker::QueueSource;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    socket: Socket,
    /// Set between sending a request and reading its reply. Still set on
    /// entry means the last call was dropped or failed mid-exchange, and a
    /// stale reply may be in flight.
    awaiting_reply: bool,
}

/// A queue on a remote gateway, reached over the consumer WebSocket.
///
/// Requests are strictly request/response on one socket, so calls are
/// serialized by a lock; a long poll holds it until the server replies.
/// A call that is cancelled mid-request (a timeout around `receive`, say)
/// leaves the socket out of step, so the next call reconnects first.
pub struct RemoteQueue {
    name: String,
    url: String,
    connection: Mutex<Connection>,
}

impl RemoteQueue {
    pub async fn connect(url: &str, queue: &str) -> Result<Self> {
        let (socket, _) = connect_async(url).await?;
        info!(url, queue, "connected to consumer server");
        Ok(Self {
            name: queue.to_string(),
            url: url.to_string(),
            connection: Mutex::new(Connection {
                socket,
                awaiting_reply: false,
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, request: &ClientMessage) -> Result<ServerMessage> {
        let text = serde_json::to_string(request)?;
        let mut conn = self.connection.lock().await;

        if conn.awaiting_reply {
            debug!(url = %self.url, queue = %self.name, "reconnecting after abandoned request");
            // Closing drops the server side of the old poll.
            let _ = conn.socket.close(None).await;
            let (socket, _) = connect_async(self.url.as_str()).await?;
            conn.socket = socket;
            conn.awaiting_reply = false;
        }

        conn.awaiting_reply = true;
        conn.socket.send(WsMessage::Text(text.into())).await?;

        while let Some(frame) = conn.socket.next().await {
            let frame = frame?;
            if frame.is_close() {
                break;
            }
            if !frame.is_text() {
                continue;
            }
            conn.awaiting_reply = false;
            let reply: ServerMessage = serde_json::from_slice(&frame.into_data())?;
            if let ServerMessage::Error { message } = reply {
                return Err(BrokerError::Transport(message));
            }
            return Ok(reply);
        }
        Err(BrokerError::Transport(format!(
            "connection to {} closed",
            self.url
        )))
    }
}

#[async_trait]
impl QueueSource for RemoteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<QueuedEntry>> {
        let request = ClientMessage::Receive {
            queue: self.name.clone(),
            max_messages,
            wait_time_ms: wait_time.as_millis() as u64,
        };
        match self.request(&request).await? {
            ServerMessage::Messages { entries, .. } => {
                debug!(queue = %self.name, received = entries.len(), "remote receive");
                Ok(entries)
            }
            other => Err(BrokerError::Transport(format!(
                "unexpected reply to receive: {other:?}"
            ))),
        }
    }

    async fn acknowledge(&self, entry_id: &str) -> Result<AckOutcome> {
        let request = ClientMessage::Ack {
            queue: self.name.clone(),
            entry_id: entry_id.to_string(),
        };
        match self.request(&request).await? {
            ServerMessage::AckResult { found: true, .. } => Ok(AckOutcome::Acknowledged),
            ServerMessage::AckResult { found: false, .. } => Ok(AckOutcome::NotFound),
            other => Err(BrokerError::Transport(format!(
                "unexpected reply to ack: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for RemoteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteQueue")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish()
    }
}

//! Consumer WebSocket server
//!
//! Lets workers in other processes drive a queue remotely. Each connection
//! gets an id and an outbound channel drained by its own send task. Requests
//! on one connection are served in order: a long `receive` holds up the
//! next request on that socket, never other connections. The socket is
//! still read during a long poll, so a consumer that disconnects abandons
//! its poll instead of having entries leased to a dead connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Broker;
use crate::broker::queue::AckOutcome;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::Result;

/// Upper bounds applied to remote `receive` requests.
pub const MAX_MESSAGES_CAP: usize = 10;
pub const MAX_WAIT: Duration = Duration::from_secs(20);

/// Execute one protocol request against the broker.
pub async fn handle_client_message(broker: &Broker, request: ClientMessage) -> ServerMessage {
    match request {
        ClientMessage::Receive {
            queue,
            max_messages,
            wait_time_ms,
        } => {
            let source = match broker.queue(&queue) {
                Ok(source) => source,
                Err(e) => return ServerMessage::Error { message: e.to_string() },
            };
            let max_messages = max_messages.min(MAX_MESSAGES_CAP);
            let wait = Duration::from_millis(wait_time_ms).min(MAX_WAIT);
            match source.receive(max_messages, wait).await {
                Ok(entries) => ServerMessage::Messages { queue, entries },
                Err(e) => ServerMessage::Error { message: e.to_string() },
            }
        }
        ClientMessage::Ack { queue, entry_id } => {
            let outcome = broker
                .queue(&queue)
                .and_then(|source| source.acknowledge(&entry_id));
            match outcome {
                Ok(outcome) => ServerMessage::AckResult {
                    entry_id,
                    found: outcome == AckOutcome::Acknowledged,
                },
                Err(e) => ServerMessage::Error { message: e.to_string() },
            }
        }
    }
}

fn encode_reply(reply: &ServerMessage) -> Option<WsMessage> {
    match serde_json::to_string(reply) {
        Ok(text) => Some(WsMessage::Text(text.into())),
        Err(e) => {
            error!("failed to encode reply: {e}");
            None
        }
    }
}

/// Accept consumer connections on `addr` until `shutdown` is cancelled.
pub async fn start_consumer_server(
    addr: &str,
    broker: Arc<Broker>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("consumer server listening on ws://{}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            },
        };

        let broker = broker.clone();
        let shutdown = shutdown.clone();
        let consumer_id = format!("consumer-{}", uuid::Uuid::new_v4());

        spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, "WebSocket handshake error: {e}");
                    return;
                }
            };
            info!(consumer = %consumer_id, %peer, "consumer connected");

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

            {
                let consumer_id = consumer_id.clone();
                spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if let Err(e) = ws_sender.send(msg).await {
                            warn!(consumer = %consumer_id, "failed to send: {e}");
                            break;
                        }
                    }
                    debug!(consumer = %consumer_id, "send loop closed");
                });
            }

            // Frames that arrived while a request was still being served.
            let mut backlog: VecDeque<WsMessage> = VecDeque::new();

            'connection: loop {
                let msg = match backlog.pop_front() {
                    Some(msg) => msg,
                    None => tokio::select! {
                        _ = shutdown.cancelled() => break,
                        msg = ws_receiver.next() => match msg {
                            Some(Ok(msg)) => msg,
                            _ => break,
                        },
                    },
                };
                if msg.is_close() {
                    break;
                }
                if !msg.is_text() {
                    continue;
                }
                let Ok(text) = msg.to_text() else {
                    continue;
                };

                let reply = match serde_json::from_str::<ClientMessage>(text) {
                    Ok(request) => {
                        // Keep reading while the request runs: a consumer that
                        // goes away must drop its pending long poll before it
                        // claims anything.
                        let pending = handle_client_message(&broker, request);
                        tokio::pin!(pending);
                        loop {
                            tokio::select! {
                                _ = shutdown.cancelled() => break 'connection,
                                reply = &mut pending => break reply,
                                incoming = ws_receiver.next() => match incoming {
                                    Some(Ok(frame)) if !frame.is_close() => backlog.push_back(frame),
                                    _ => {
                                        debug!(consumer = %consumer_id, "consumer left during request");
                                        break 'connection;
                                    }
                                },
                            }
                        }
                    }
                    Err(err) => {
                        warn!(
                            consumer = %consumer_id,
                            "invalid consumer message: {err} | {}",
                            text.chars().take(100).collect::<String>()
                        );
                        ServerMessage::Error {
                            message: format!("invalid request: {err}"),
                        }
                    }
                };

                if let Some(frame) = encode_reply(&reply) {
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
            }

            info!(consumer = %consumer_id, "consumer disconnected");
        });
    }

    info!("consumer server stopped");
    Ok(())
}

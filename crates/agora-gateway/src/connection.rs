use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use agora_chat::ChatService;
use agora_types::events::ClientEnvelope;

use crate::presence::PresencePropagator;
use crate::registry::{ConnectionRegistry, Outbound};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Close code sent when a newer connection for the same user takes over.
const CLOSE_SUPERSEDED: u16 = 4000;

/// Drive a pre-authenticated WebSocket connection until it closes. The JWT
/// was already validated at the HTTP upgrade layer.
pub async fn serve(
    socket: WebSocket,
    registry: ConnectionRegistry,
    chat: Arc<ChatService>,
    presence: Arc<PresencePropagator>,
    user_id: Uuid,
) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut outbound_rx) = registry.register(user_id).await;
    presence.connected(user_id).await;
    info!(%user_id, %conn_id, "gateway connection open");

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward registry traffic -> client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(Outbound::Envelope(envelope)) => {
                            let text = match serde_json::to_string(&envelope) {
                                Ok(text) => text,
                                Err(err) => {
                                    warn!(%user_id, error = %err, "failed to encode outbound envelope");
                                    continue;
                                }
                            };
                            if sender.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Superseded) => {
                            // Tell the old client why it is going away, then stop.
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: CLOSE_SUPERSEDED,
                                    reason: "superseded by a newer connection".into(),
                                })))
                                .await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(%user_id, "heartbeat timeout, dropping connection");
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read envelopes from the client. Frames are handled sequentially, so a
    // client's own commands apply in the order it sent them.
    let chat_recv = chat.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEnvelope>(&text) {
                    Ok(envelope) => handle_envelope(&chat_recv, user_id, envelope).await,
                    Err(err) => {
                        warn!(
                            %user_id,
                            error = %err,
                            raw = truncate_for_log(&text, 200),
                            "bad client envelope, dropping frame"
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Superseded connections lost the registry entry already; only the
    // current owner announces the user offline.
    if registry.unregister(user_id, conn_id).await {
        presence.disconnected(user_id).await;
    }
    info!(%user_id, %conn_id, "gateway connection closed");
}

/// Clamp a frame for logging without splitting a multibyte character.
/// Client frames are arbitrary text; byte-slicing them would panic.
fn truncate_for_log(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Envelope handling failures never terminate the connection: the domain
/// already decided the command was invalid, the socket is still fine.
async fn handle_envelope(chat: &ChatService, user_id: Uuid, envelope: ClientEnvelope) {
    let outcome = match envelope {
        ClientEnvelope::DirectMessage {
            conversation_id,
            content,
            replying_to_message_id,
        } => chat
            .send_message(user_id, conversation_id, content, replying_to_message_id)
            .await
            .map(|_| ()),
        ClientEnvelope::TypingStart { conversation_id } => {
            chat.typing(user_id, conversation_id, true).await
        }
        ClientEnvelope::TypingStop { conversation_id } => {
            chat.typing(user_id, conversation_id, false).await
        }
        ClientEnvelope::MarkRead { conversation_id } => {
            chat.mark_read(conversation_id, user_id).await
        }
        ClientEnvelope::ReactToMessage { message_id, kind } => {
            chat.toggle_reaction(message_id, user_id, kind).await
        }
    };

    if let Err(err) = outcome {
        debug!(%user_id, error = %err, "client envelope rejected");
    }
}

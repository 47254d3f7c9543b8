//! WebSocket connection handler.
//!
//! Runs one connection's full lifecycle: wait for a verified `join`
//! handshake, register the session in the presence registry, forward routed
//! events out, and clean up exactly once on disconnect.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth;
use crate::protocol::{ChatEvent, ClientMessage, ServerMessage, UserId};
use crate::registry::{SessionId, SessionSender};
use crate::state::RelayState;

/// Handle a single WebSocket connection.
///
/// 1. Waits for a `join` message and verifies its token
/// 2. Registers the session and spawns a sender task draining its channel
/// 3. Processes incoming messages until the connection closes
/// 4. Removes the session from the registry, whatever ended the connection
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let session_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound channel for this session; the delivery router pushes here.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // ── Step 1: Wait for Join ─────────────────────────────────────────────

    let Some(user_id) = wait_for_join(&state, session_id, &mut ws_receiver, &mut ws_sender).await
    else {
        return; // Disconnected before joining — nothing to clean up
    };

    // ── Step 2: Register Session ──────────────────────────────────────────

    state.registry.add_session(user_id, session_id, tx.clone());

    // ── Step 3: Spawn Sender Task ─────────────────────────────────────────

    // Drains this session's channel in order, so delivery is FIFO per
    // session even while the receive loop is busy.
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Step 4: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => handle_client_message(&state, user_id, &tx, msg),
                Err(e) => {
                    tracing::warn!(
                        user_id,
                        session_id = %session_id,
                        error = %e,
                        "Failed to parse client message"
                    );
                    let _ = tx.send(ServerMessage::Error {
                        message: format!("invalid message format: {}", e),
                    });
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(user_id, session_id = %session_id, "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    user_id,
                    session_id = %session_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Ping, Pong — axum answers pings at the protocol level
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    // Runs once regardless of what ended the loop; remove_session tolerates
    // a racing removal from a failed push in the router.
    state.registry.remove_session(user_id, session_id);
    sender_task.abort();
    tracing::info!(user_id, session_id = %session_id, "Session disconnected");
}

/// Drive the handshake phase of a connection.
///
/// Only `join` and `ping` are honored here; a `send_message` or a malformed
/// frame is rejected with an `error` frame and the connection stays open.
/// Returns the bound user id once a join's token verifies, or `None` if the
/// transport ended first.
async fn wait_for_join<S, K>(
    state: &RelayState,
    session_id: SessionId,
    ws_receiver: &mut S,
    ws_sender: &mut K,
) -> Option<UserId>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    K: Sink<Message> + Unpin,
{
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Join { user_id, token }) => {
                        match auth::authorize_join(&state.config.jwt_secret, &token, user_id) {
                            Ok(_) => {
                                let ack = ServerMessage::Joined { user_id };
                                if send_frame(ws_sender, &ack).await.is_err() {
                                    return None; // Connection closed
                                }
                                return Some(user_id);
                            }
                            Err(e) => {
                                tracing::warn!(
                                    session_id = %session_id,
                                    user_id,
                                    error = %e,
                                    "Join rejected"
                                );
                                let err = ServerMessage::Error {
                                    message: e.to_string(),
                                };
                                let _ = send_frame(ws_sender, &err).await;
                            }
                        }
                    }
                    Ok(ClientMessage::Ping) => {
                        let _ = send_frame(ws_sender, &ServerMessage::Pong).await;
                    }
                    Ok(ClientMessage::SendMessage { .. }) => {
                        // Unidentified send: reject, keep the connection.
                        let err = ServerMessage::Error {
                            message: "must join before sending".to_string(),
                        };
                        let _ = send_frame(ws_sender, &err).await;
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Failed to parse client message");
                        let err = ServerMessage::Error {
                            message: format!("invalid message format: {}", e),
                        };
                        let _ = send_frame(ws_sender, &err).await;
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return None; // Disconnected before joining
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = %session_id, error = %e, "WebSocket error");
                return None; // Transport failed before joining
            }
            _ => continue, // Binary, Pong — ignore
        }
    }
}

/// Handle a parsed client message on a joined session.
fn handle_client_message(
    state: &RelayState,
    user_id: UserId,
    tx: &SessionSender,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Join {
            user_id: rejoin_id, ..
        } => {
            if rejoin_id == user_id {
                // Idempotent re-join. The binding is already established and
                // cannot change, so the re-presented token is not checked
                // again — re-ack.
                let _ = tx.send(ServerMessage::Joined { user_id });
            } else {
                let _ = tx.send(ServerMessage::Error {
                    message: format!("session already joined as user {}", user_id),
                });
            }
        }

        ClientMessage::SendMessage { to, content } => {
            // `from` is the session's binding, never client input. The
            // client persists the same message over REST on its own; the
            // live push and the durable write are independent.
            let event = ChatEvent {
                to,
                from: user_id,
                content,
                timestamp: Utc::now().timestamp_millis(),
            };
            let delivered = state.registry.route(event);
            tracing::debug!(from = user_id, to, delivered, "Routed chat event");
        }

        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }
}

/// Serialize a frame and push it directly on the socket.
/// Used before the sender task exists (handshake phase).
async fn send_frame<K>(ws_sender: &mut K, msg: &ServerMessage) -> Result<(), K::Error>
where
    K: Sink<Message> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => ws_sender.send(Message::Text(json)).await,
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Claims;
    use crate::state::RelayConfig;
    use futures::channel::mpsc as futures_mpsc;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_state() -> RelayState {
        RelayState::new(RelayConfig::default())
    }

    fn login_token(user_id: UserId) -> String {
        let claims = Claims {
            id: user_id,
            username: None,
            exp: Utc::now().timestamp() + 3600,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"your-secret-key"),
        )
        .unwrap()
    }

    fn joined_session(
        state: &RelayState,
        user_id: UserId,
    ) -> (SessionId, SessionSender, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();
        state.registry.add_session(user_id, session_id, tx.clone());
        (session_id, tx, rx)
    }

    fn text(msg: &ClientMessage) -> Message {
        Message::Text(serde_json::to_string(msg).unwrap())
    }

    fn parse_frame(msg: Message) -> ServerMessage {
        match msg {
            Message::Text(json) => serde_json::from_str(&json).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    // ── Joined-session dispatch ───────────────────────────────────────────

    #[test]
    fn test_rejoin_same_user_is_idempotent_reack() {
        let state = test_state();
        let (session_id, tx, mut rx) = joined_session(&state, 7);

        handle_client_message(
            &state,
            7,
            &tx,
            ClientMessage::Join {
                user_id: 7,
                token: String::new(),
            },
        );

        match rx.try_recv().unwrap() {
            ServerMessage::Joined { user_id } => assert_eq!(user_id, 7),
            other => panic!("Expected Joined, got {:?}", other),
        }
        assert!(state.registry.sessions_for(7).contains(&session_id));
    }

    #[test]
    fn test_rejoin_different_user_rejected_binding_unchanged() {
        let state = test_state();
        let (session_id, tx, mut rx) = joined_session(&state, 7);

        handle_client_message(
            &state,
            7,
            &tx,
            ClientMessage::Join {
                user_id: 3,
                token: login_token(3),
            },
        );

        match rx.try_recv().unwrap() {
            ServerMessage::Error { message } => {
                assert!(message.contains("already joined as user 7"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        // The session stays bound to 7 and never appears under 3.
        assert!(state.registry.sessions_for(7).contains(&session_id));
        assert!(state.registry.sessions_for(3).is_empty());
    }

    #[test]
    fn test_send_uses_bound_user_as_from() {
        let state = test_state();
        let (_s7, tx7, mut rx7) = joined_session(&state, 7);
        let (_s9, _tx9, mut rx9) = joined_session(&state, 9);

        handle_client_message(
            &state,
            7,
            &tx7,
            ClientMessage::SendMessage {
                to: 9,
                content: "hi".to_string(),
            },
        );

        match rx9.try_recv().unwrap() {
            ServerMessage::ReceiveMessage {
                to, from, content, ..
            } => {
                assert_eq!(to, 9);
                assert_eq!(from, 7);
                assert_eq!(content, "hi");
            }
            other => panic!("Expected ReceiveMessage, got {:?}", other),
        }
        // No echo to the sender's own session.
        assert!(rx7.try_recv().is_err());
    }

    #[test]
    fn test_ping_answers_pong() {
        let state = test_state();
        let (_s, tx, mut rx) = joined_session(&state, 7);

        handle_client_message(&state, 7, &tx, ClientMessage::Ping);

        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Pong));
    }

    // ── Handshake phase ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_send_before_join_rejected_connection_kept() {
        let state = test_state();
        let mut stream = futures::stream::iter(vec![
            Ok(text(&ClientMessage::SendMessage {
                to: 1,
                content: "early".to_string(),
            })),
            Ok(text(&ClientMessage::Join {
                user_id: 7,
                token: login_token(7),
            })),
        ]);
        let (mut sink, frames) = futures_mpsc::unbounded();

        let joined = wait_for_join(&state, Uuid::new_v4(), &mut stream, &mut sink).await;
        assert_eq!(joined, Some(7));

        drop(sink);
        let sent: Vec<ServerMessage> = frames.map(parse_frame).collect().await;
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            ServerMessage::Error { message } => {
                assert!(message.contains("must join before sending"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        assert!(matches!(sent[1], ServerMessage::Joined { user_id: 7 }));
    }

    #[tokio::test]
    async fn test_invalid_token_join_rejected_connection_kept() {
        let state = test_state();
        let mut stream = futures::stream::iter(vec![
            Ok(text(&ClientMessage::Join {
                user_id: 7,
                token: "not-a-jwt".to_string(),
            })),
            Ok(Message::Close(None)),
        ]);
        let (mut sink, frames) = futures_mpsc::unbounded();

        let joined = wait_for_join(&state, Uuid::new_v4(), &mut stream, &mut sink).await;
        assert_eq!(joined, None);

        drop(sink);
        let sent: Vec<ServerMessage> = frames.map(parse_frame).collect().await;
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            ServerMessage::Error { message } => {
                assert!(message.contains("invalid auth token"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_error_before_join_ends_connection() {
        let state = test_state();
        // A join after the error must never be processed.
        let mut stream = futures::stream::iter(vec![
            Err(axum::Error::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))),
            Ok(text(&ClientMessage::Join {
                user_id: 7,
                token: login_token(7),
            })),
        ]);
        let (mut sink, frames) = futures_mpsc::unbounded();

        let joined = wait_for_join(&state, Uuid::new_v4(), &mut stream, &mut sink).await;
        assert_eq!(joined, None);

        drop(sink);
        let sent: Vec<Message> = frames.collect().await;
        assert!(sent.is_empty());
    }
}

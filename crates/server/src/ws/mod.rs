// Room websocket endpoint.
//
// A connection moves through authenticate -> authorize -> active -> closed.
// Handshake failures end in a close frame whose code tells the client what
// to do next. Once active, inbound frames are processed strictly in order:
// each edit is saved and broadcast before the next one is read.

pub mod registry;
mod session;

use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use syncroom_common::protocol::ws::{
    ServerMessage, ACCESS_DENIED_REASON, AUTHENTICATION_FAILED_REASON, CLOSE_ACCESS_DENIED,
    CLOSE_AUTHENTICATION_FAILED, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, INTERNAL_ERROR_REASON,
    SHUTDOWN_REASON,
};
use syncroom_common::types::Role;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::app::RoomServices;
use crate::auth::jwt::Identity;
use crate::auth::middleware::bearer_token_from_headers;
use crate::error::request_id_from_headers_or_generate;
use crate::metrics::{self, RejectReason};
use registry::ConnectionHandle;
pub(crate) use session::announce_presence;
use session::RoomSession;

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

/// Frames larger than this multiple of the configured edit limit are refused
/// by the websocket layer itself, which ends the connection.
const TRANSPORT_LIMIT_FACTOR: usize = 4;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    token: Option<String>,
}

pub fn router(services: RoomServices) -> Router {
    Router::new().route("/ws/{*room_id}", get(ws_upgrade)).with_state(services)
}

pub async fn ws_upgrade(
    Path(room_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(services): State<RoomServices>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query
        .token
        .filter(|token| !token.trim().is_empty())
        .or_else(|| bearer_token_from_headers(&headers).map(ToOwned::to_owned));
    let request_id = request_id_from_headers_or_generate(&headers);
    let transport_limit = services.max_frame_bytes.saturating_mul(TRANSPORT_LIMIT_FACTOR);

    ws.max_message_size(transport_limit).max_frame_size(transport_limit).on_upgrade(
        move |socket| {
            let span = tracing::info_span!("room_connection", room_id = %room_id, request_id = %request_id);
            handle_socket(services, room_id, token, socket).instrument(span)
        },
    )
}

async fn handle_socket(
    services: RoomServices,
    room_id: String,
    token: Option<String>,
    mut socket: WebSocket,
) {
    let identity = match authenticate(&services, token.as_deref()) {
        Some(identity) => identity,
        None => {
            metrics::connection_rejected(RejectReason::Authentication);
            close_with(&mut socket, CLOSE_AUTHENTICATION_FAILED, AUTHENTICATION_FAILED_REASON).await;
            return;
        }
    };

    let role = match services.access.resolve_role(&room_id, identity.user_id).await {
        Ok(Some(role)) => role,
        Ok(None) => {
            info!(user_id = %identity.user_id, "room access denied");
            metrics::connection_rejected(RejectReason::Authorization);
            close_with(&mut socket, CLOSE_ACCESS_DENIED, ACCESS_DENIED_REASON).await;
            return;
        }
        Err(err) => {
            error!(user_id = %identity.user_id, error = ?err, "failed to resolve room role");
            metrics::connection_rejected(RejectReason::Unavailable);
            close_with(&mut socket, CLOSE_INTERNAL_ERROR, INTERNAL_ERROR_REASON).await;
            return;
        }
    };

    let connection_id = Uuid::new_v4();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Message>();
    let Some(mut session) =
        admit(&services, &room_id, connection_id, &identity, role, outbound_sender).await
    else {
        metrics::connection_rejected(RejectReason::Unavailable);
        close_with(&mut socket, CLOSE_INTERNAL_ERROR, INTERNAL_ERROR_REASON).await;
        return;
    };
    info!(
        user_id = %identity.user_id,
        connection_id = %connection_id,
        role = %role,
        "room connection active"
    );

    // Loaded after registration so any edit saved later is also queued for us.
    let snapshot = match services.documents.load(&room_id).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(error = ?err, "failed to load room document");
            session.close().await;
            close_with(&mut socket, CLOSE_INTERNAL_ERROR, INTERNAL_ERROR_REASON).await;
            return;
        }
    };
    if !snapshot.is_empty()
        && send_ws_message(&mut socket, &ServerMessage::snapshot(snapshot)).await.is_err()
    {
        session.close().await;
        return;
    }
    if send_ws_message(&mut socket, &ServerMessage::Role { role: session.role() }).await.is_err() {
        session.close().await;
        return;
    }

    // Heartbeat: ping every interval; a peer that has not answered within one
    // interval plus the timeout is gone.
    let heartbeat_period = Duration::from_millis(HEARTBEAT_INTERVAL_MS);
    let mut heartbeat_interval = tokio::time::interval(heartbeat_period);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_deadline = heartbeat_period + Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    let mut shutdown = services.registry.shutdown_signal();

    loop {
        tokio::select! {
            Ok(()) = async { shutdown.wait_for(|stopping| *stopping).await.map(|_| ()) } => {
                info!(connection_id = %connection_id, "instance shutting down, closing connection");
                close_with(&mut socket, CLOSE_GOING_AWAY, SHUTDOWN_REASON).await;
                break;
            }
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_deadline {
                    warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if socket.send(outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                let reply = match message {
                    Ok(Message::Text(raw_message)) => session.handle_text(raw_message.as_str()).await,
                    Ok(Message::Binary(payload)) => session.handle_binary(&payload).await,
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                        None
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                        None
                    }
                    Ok(Message::Close(_)) => break,
                    Err(err) => {
                        debug!(connection_id = %connection_id, error = %err, "websocket receive failed");
                        break;
                    }
                };

                if let Some(reply) = reply {
                    if send_ws_message(&mut socket, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    session.close().await;
    info!(connection_id = %connection_id, "room connection closed");
}

fn authenticate(services: &RoomServices, token: Option<&str>) -> Option<Identity> {
    let Some(token) = token else {
        debug!("room connection without credential");
        return None;
    };
    match services.identity.verify_credential(token) {
        Ok(identity) => Some(identity),
        Err(error) => {
            debug!(error = %error, "room credential rejected");
            None
        }
    }
}

/// Register the connection locally and in presence, then announce the new
/// member list. Returns `None` (with nothing left registered) if presence
/// cannot be recorded.
async fn admit(
    services: &RoomServices,
    room_id: &str,
    connection_id: Uuid,
    identity: &Identity,
    role: Role,
    outbound: mpsc::UnboundedSender<Message>,
) -> Option<RoomSession> {
    services
        .registry
        .register(
            room_id,
            ConnectionHandle {
                connection_id,
                user_id: identity.user_id,
                username: identity.username.clone(),
                role,
                outbound,
            },
        )
        .await;

    if let Err(err) = services.presence.add(room_id, identity.user_id, connection_id).await {
        error!(user_id = %identity.user_id, error = ?err, "failed to record presence");
        services.registry.unregister(room_id, connection_id).await;
        return None;
    }
    metrics::connection_opened();

    announce_presence(services, room_id).await;

    Some(RoomSession::new(
        services.clone(),
        room_id.to_owned(),
        connection_id,
        identity.user_id,
        identity.username.clone(),
        role,
    ))
}

async fn send_ws_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let encoded = serde_json::to_string(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame { code, reason: reason.into() };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_interval_is_15_seconds() {
        assert_eq!(HEARTBEAT_INTERVAL_MS, 15_000);
    }

    #[test]
    fn heartbeat_timeout_is_less_than_interval() {
        assert!(HEARTBEAT_TIMEOUT_MS < HEARTBEAT_INTERVAL_MS);
    }

    #[test]
    fn transport_limit_leaves_room_for_rejecting_oversized_edits() {
        assert!(TRANSPORT_LIMIT_FACTOR > 1);
    }
}

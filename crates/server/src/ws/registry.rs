use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::Message;
use syncroom_common::protocol::ws::ServerMessage;
use syncroom_common::types::Role;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::error;
use uuid::Uuid;

/// One live connection as seen by the rest of this instance.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
    /// Queue drained by the connection's socket task.
    pub outbound: mpsc::UnboundedSender<Message>,
}

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// This instance's live connections, grouped by room.
#[derive(Debug)]
pub struct ConnectionRegistry {
    rooms: RwLock<HashMap<String, HashMap<Uuid, ConnectionHandle>>>,
    shutdown: watch::Sender<bool>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { rooms: RwLock::default(), shutdown }
    }
}

impl ConnectionRegistry {
    /// Receiver that flips to `true` once [`Self::begin_shutdown`] is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask every live connection on this instance to close.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until every connection has unregistered or `grace` elapses.
    /// Returns the number of connections still registered.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.connection_count().await;
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                return remaining;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    pub async fn register(&self, room_id: &str, handle: ConnectionHandle) {
        self.rooms
            .write()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .insert(handle.connection_id, handle);
    }

    /// Remove a connection. Returns false when it was not registered.
    pub async fn unregister(&self, room_id: &str, connection_id: Uuid) -> bool {
        let mut guard = self.rooms.write().await;
        let Some(connections) = guard.get_mut(room_id) else {
            return false;
        };
        let removed = connections.remove(&connection_id).is_some();
        if connections.is_empty() {
            guard.remove(room_id);
        }
        removed
    }

    pub async fn has_room(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn room_connection_count(&self, room_id: &str) -> usize {
        self.rooms.read().await.get(room_id).map_or(0, HashMap::len)
    }

    pub async fn connection_count(&self) -> usize {
        self.rooms.read().await.values().map(HashMap::len).sum()
    }

    /// Queue `message` for every connection in the room except `exclude`.
    ///
    /// Connections whose queue is already closed are skipped; delivery to the
    /// rest continues. Returns the number of connections the message was
    /// queued for.
    pub async fn broadcast(
        &self,
        room_id: &str,
        message: &ServerMessage,
        exclude: Option<Uuid>,
    ) -> usize {
        let encoded = match serde_json::to_string(message) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(room_id = %room_id, error = %err, "failed to encode room broadcast");
                return 0;
            }
        };
        let frame = Message::Text(encoded.into());

        let mut recipients = Vec::new();
        {
            let guard = self.rooms.read().await;
            if let Some(connections) = guard.get(room_id) {
                for (connection_id, handle) in connections {
                    if Some(*connection_id) == exclude {
                        continue;
                    }
                    recipients.push(handle.outbound.clone());
                }
            }
        }

        let mut sent_count = 0;
        for recipient in recipients {
            if recipient.send(frame.clone()).is_ok() {
                sent_count += 1;
            }
        }

        sent_count
    }
}

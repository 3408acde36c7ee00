use syncroom_common::protocol::ws::{
    decode_content_envelope, ServerMessage, EDIT_TOO_LARGE, INVALID_MESSAGE, SAVE_FAILED,
    VIEWER_EDIT_REJECTED,
};
use syncroom_common::types::Role;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::app::RoomServices;
use crate::metrics;
use crate::relay::RelayFrame;

/// An admitted connection: registered locally and counted in presence.
///
/// [`RoomSession::close`] undoes both and runs at most once. A session that
/// is dropped without being closed (its task was cancelled) schedules the
/// same cleanup on the runtime.
pub(crate) struct RoomSession {
    services: RoomServices,
    room_id: String,
    connection_id: Uuid,
    user_id: Uuid,
    username: String,
    role: Role,
    closed: bool,
}

impl RoomSession {
    pub(crate) fn new(
        services: RoomServices,
        room_id: String,
        connection_id: Uuid,
        user_id: Uuid,
        username: String,
        role: Role,
    ) -> Self {
        Self { services, room_id, connection_id, user_id, username, role, closed: false }
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    /// Apply a text frame. Its payload is the new document text verbatim.
    /// Returns the envelope owed to the sender, if any; successful edits
    /// reply with nothing.
    pub(crate) async fn handle_text(&self, raw: &str) -> Option<ServerMessage> {
        if let Some(rejection) = self.gate(raw.len()) {
            return Some(rejection);
        }
        self.apply_edit(raw.to_owned()).await
    }

    /// Apply a binary frame, which must carry a `content` envelope.
    pub(crate) async fn handle_binary(&self, payload: &[u8]) -> Option<ServerMessage> {
        if let Some(rejection) = self.gate(payload.len()) {
            return Some(rejection);
        }

        match decode_content_envelope(payload) {
            Ok(text) => self.apply_edit(text).await,
            Err(error) => {
                debug!(room_id = %self.room_id, error = %error, "unreadable edit rejected");
                metrics::invalid_message();
                Some(ServerMessage::error(INVALID_MESSAGE))
            }
        }
    }

    /// Checks shared by both frame kinds: the role may edit and the frame
    /// fits the size limit.
    fn gate(&self, bytes: usize) -> Option<ServerMessage> {
        if !self.role.can_edit() {
            debug!(room_id = %self.room_id, user_id = %self.user_id, "viewer edit rejected");
            metrics::viewer_edit_rejected();
            return Some(ServerMessage::error(VIEWER_EDIT_REJECTED));
        }

        if bytes > self.services.max_frame_bytes {
            debug!(room_id = %self.room_id, bytes, "oversized edit rejected");
            metrics::invalid_message();
            return Some(ServerMessage::error(EDIT_TOO_LARGE));
        }

        None
    }

    async fn apply_edit(&self, text: String) -> Option<ServerMessage> {
        match self.services.documents.save(&self.room_id, &text).await {
            Ok(updated_at) => {
                debug!(room_id = %self.room_id, %updated_at, bytes = text.len(), "document saved");
            }
            Err(err) => {
                error!(
                    room_id = %self.room_id,
                    user_id = %self.user_id,
                    error = ?err,
                    "failed to save document, edit not broadcast"
                );
                metrics::persistence_failure();
                return Some(ServerMessage::error(SAVE_FAILED));
            }
        }

        let message = ServerMessage::edit(text, self.username.clone());
        publish(&self.services, &self.room_id, message.clone()).await;
        let delivered = self
            .services
            .registry
            .broadcast(&self.room_id, &message, Some(self.connection_id))
            .await;
        metrics::edit_applied();
        debug!(room_id = %self.room_id, delivered, "edit broadcast");

        None
    }

    /// Leave the registry and presence set, then tell the room. Idempotent.
    pub(crate) async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        release(&self.services, &self.room_id, self.user_id, self.connection_id).await;
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(room_id = %self.room_id, "no runtime to release dropped room session");
            return;
        };
        let services = self.services.clone();
        let room_id = std::mem::take(&mut self.room_id);
        let user_id = self.user_id;
        let connection_id = self.connection_id;
        runtime.spawn(async move {
            release(&services, &room_id, user_id, connection_id).await;
        });
    }
}

async fn release(services: &RoomServices, room_id: &str, user_id: Uuid, connection_id: Uuid) {
    services.registry.unregister(room_id, connection_id).await;
    if let Err(error) = services.presence.remove(room_id, user_id, connection_id).await {
        warn!(room_id = %room_id, user_id = %user_id, error = ?error, "failed to remove presence");
    }
    announce_presence(services, room_id).await;
    metrics::connection_closed();
    debug!(room_id = %room_id, connection_id = %connection_id, "room session released");
}

/// Send the room's full online-user list to every local connection and to
/// the other instances.
pub(crate) async fn announce_presence(services: &RoomServices, room_id: &str) {
    let members = match services.presence.members(room_id).await {
        Ok(members) => members,
        Err(error) => {
            warn!(room_id = %room_id, error = ?error, "failed to read room presence");
            return;
        }
    };
    let users = match services.access.usernames_for(&members).await {
        Ok(users) => users,
        Err(error) => {
            warn!(room_id = %room_id, error = ?error, "failed to resolve presence usernames");
            return;
        }
    };

    let message = ServerMessage::Presence { users };
    services.registry.broadcast(room_id, &message, None).await;
    publish(services, room_id, message).await;
    metrics::presence_broadcast();
}

pub(crate) async fn publish(services: &RoomServices, room_id: &str, message: ServerMessage) {
    let kind = message.kind();
    let frame = RelayFrame::new(room_id, services.instance_id, message);
    match services.relay.publish(&frame).await {
        Ok(()) => metrics::relay_published(),
        Err(error) => {
            warn!(room_id = %room_id, kind, error = %error, "relay publish failed");
            metrics::relay_publish_failure();
        }
    }
}

// Inter-instance relay.
//
// Every instance publishes room traffic on one shared channel and runs one
// subscriber that demultiplexes frames by the room id they carry. Delivery is
// best-effort and at-most-once; losses are reported to the subscriber as
// events rather than hidden.

pub mod listener;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use syncroom_common::protocol::ws::ServerMessage;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use listener::RelayListener;

/// Channel name used for `LISTEN`/`NOTIFY`.
pub const RELAY_CHANNEL: &str = "syncroom_relay";

/// PostgreSQL rejects `NOTIFY` payloads of 8000 bytes or more.
const NOTIFY_PAYLOAD_LIMIT: usize = 7_900;

const MEMORY_BUS_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub room_id: String,
    /// Instance that published the frame.
    pub origin: Uuid,
    pub body: RelayBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayBody {
    Message { message: ServerMessage },
    /// The room's document changed but the text was too large to inline.
    /// Receivers read the text back from the document store.
    ContentRef { edited_by: Option<String> },
}

impl RelayFrame {
    pub fn new(room_id: impl Into<String>, origin: Uuid, message: ServerMessage) -> Self {
        Self { room_id: room_id.into(), origin, body: RelayBody::Message { message } }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay backend is unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("relay frame could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("relay frame of {0} bytes exceeds the notification payload limit")]
    PayloadTooLarge(usize),
    #[error("relay bus is closed")]
    Closed,
}

/// What a subscriber observes on the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Frame(RelayFrame),
    /// The subscriber fell behind and this many frames were skipped.
    Lagged(u64),
    /// The underlying connection was re-established. Frames published while
    /// it was down are lost.
    Reconnected,
}

#[derive(Clone)]
pub enum RelayBus {
    Postgres(PgPool),
    Memory(broadcast::Sender<RelayFrame>),
}

impl RelayBus {
    pub fn memory() -> Self {
        let (sender, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        Self::Memory(sender)
    }

    pub async fn publish(&self, frame: &RelayFrame) -> Result<(), RelayError> {
        match self {
            Self::Postgres(pool) => {
                let payload = encode_notify_payload(frame)?;
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(RELAY_CHANNEL)
                    .bind(payload)
                    .execute(pool)
                    .await?;
                Ok(())
            }
            Self::Memory(sender) => {
                // No subscribers is not an error: the frame simply has no audience.
                let _ = sender.send(frame.clone());
                Ok(())
            }
        }
    }

    pub async fn subscribe(&self) -> Result<RelaySubscription, RelayError> {
        match self {
            Self::Postgres(pool) => {
                let mut listener = PgListener::connect_with(pool).await?;
                listener.listen(RELAY_CHANNEL).await?;
                Ok(RelaySubscription::Postgres(Box::new(listener)))
            }
            Self::Memory(sender) => Ok(RelaySubscription::Memory(sender.subscribe())),
        }
    }
}

pub enum RelaySubscription {
    Postgres(Box<PgListener>),
    Memory(broadcast::Receiver<RelayFrame>),
}

impl RelaySubscription {
    /// Wait for the next relay event.
    ///
    /// `Err(RelayError::Codec)` reports one undecodable frame; the
    /// subscription stays usable. Any other error means the subscription is
    /// dead and must be replaced.
    pub async fn next(&mut self) -> Result<RelayEvent, RelayError> {
        match self {
            Self::Postgres(listener) => match listener.try_recv().await? {
                Some(notification) => {
                    let frame = serde_json::from_str(notification.payload())?;
                    Ok(RelayEvent::Frame(frame))
                }
                None => Ok(RelayEvent::Reconnected),
            },
            Self::Memory(receiver) => match receiver.recv().await {
                Ok(frame) => Ok(RelayEvent::Frame(frame)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Ok(RelayEvent::Lagged(skipped)),
                Err(broadcast::error::RecvError::Closed) => Err(RelayError::Closed),
            },
        }
    }
}

/// Encode a frame for `NOTIFY`, replacing oversized document text with a
/// content reference.
fn encode_notify_payload(frame: &RelayFrame) -> Result<String, RelayError> {
    let payload = serde_json::to_string(frame)?;
    if payload.len() <= NOTIFY_PAYLOAD_LIMIT {
        return Ok(payload);
    }

    let RelayBody::Message { message: ServerMessage::Content { edited_by, .. } } = &frame.body
    else {
        return Err(RelayError::PayloadTooLarge(payload.len()));
    };

    let reference = RelayFrame {
        room_id: frame.room_id.clone(),
        origin: frame.origin,
        body: RelayBody::ContentRef { edited_by: edited_by.clone() },
    };
    let payload = serde_json::to_string(&reference)?;
    if payload.len() > NOTIFY_PAYLOAD_LIMIT {
        return Err(RelayError::PayloadTooLarge(payload.len()));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> RelayFrame {
        RelayFrame::new("alice/notes", Uuid::new_v4(), ServerMessage::edit(text, "alice"))
    }

    #[test]
    fn small_frames_are_sent_inline() {
        let original = frame("Hello world");
        let payload = encode_notify_payload(&original).expect("payload should encode");
        let decoded: RelayFrame = serde_json::from_str(&payload).expect("payload should decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn oversized_content_becomes_a_reference() {
        let original = frame(&"x".repeat(NOTIFY_PAYLOAD_LIMIT * 2));
        let payload = encode_notify_payload(&original).expect("payload should encode");
        let decoded: RelayFrame = serde_json::from_str(&payload).expect("payload should decode");

        assert_eq!(decoded.room_id, "alice/notes");
        assert_eq!(decoded.origin, original.origin);
        assert_eq!(decoded.body, RelayBody::ContentRef { edited_by: Some("alice".to_string()) });
    }

    #[test]
    fn oversized_non_content_frames_are_refused() {
        let error = ServerMessage::error("e".repeat(NOTIFY_PAYLOAD_LIMIT * 2));
        let oversized = RelayFrame::new("alice/notes", Uuid::new_v4(), error);
        assert!(matches!(
            encode_notify_payload(&oversized),
            Err(RelayError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn memory_bus_delivers_to_every_subscriber_including_publisher() {
        let bus = RelayBus::memory();
        let mut first = bus.subscribe().await.expect("subscribe");
        let mut second = bus.subscribe().await.expect("subscribe");
        let sent = frame("Hello");

        bus.publish(&sent).await.expect("publish");

        assert_eq!(first.next().await.expect("event"), RelayEvent::Frame(sent.clone()));
        assert_eq!(second.next().await.expect("event"), RelayEvent::Frame(sent));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        RelayBus::memory().publish(&frame("nobody listens")).await.expect("publish");
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_how_much_it_missed() {
        let (sender, receiver) = broadcast::channel(2);
        let bus = RelayBus::Memory(sender);
        let mut subscription = RelaySubscription::Memory(receiver);

        for index in 0..5 {
            bus.publish(&frame(&format!("edit {index}"))).await.expect("publish");
        }

        assert_eq!(subscription.next().await.expect("event"), RelayEvent::Lagged(3));
        let RelayEvent::Frame(next) = subscription.next().await.expect("event") else {
            panic!("expected a frame after the lag notice");
        };
        assert_eq!(
            next.body,
            RelayBody::Message { message: ServerMessage::edit("edit 3", "alice") }
        );
    }
}

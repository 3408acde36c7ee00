use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use syncroom_common::protocol::ws::ServerMessage;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RelayBody, RelayBus, RelayError, RelayEvent, RelayFrame, RelaySubscription};
use crate::documents::DocumentStore;
use crate::metrics::{self, RelayDropReason};
use crate::ws::registry::ConnectionRegistry;

/// Sequence of the latest content frame delivered per room.
type ContentOrder = Arc<Mutex<HashMap<String, u64>>>;

/// Drains the relay and fans each frame out to this instance's connections
/// in the frame's room.
pub struct RelayListener {
    bus: RelayBus,
    registry: Arc<ConnectionRegistry>,
    documents: DocumentStore,
    instance_id: Uuid,
    retry_delay: Duration,
    content_order: ContentOrder,
}

impl RelayListener {
    pub fn new(
        bus: RelayBus,
        registry: Arc<ConnectionRegistry>,
        documents: DocumentStore,
        instance_id: Uuid,
        retry_delay: Duration,
    ) -> Self {
        Self {
            bus,
            registry,
            documents,
            instance_id,
            retry_delay,
            content_order: ContentOrder::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Subscribe and deliver until the process exits, re-subscribing after a
    /// fixed delay whenever the relay connection fails.
    pub async fn run(self) {
        loop {
            match self.bus.subscribe().await {
                Ok(subscription) => {
                    info!(instance_id = %self.instance_id, "relay listener subscribed");
                    let error = self.drain(subscription).await;
                    warn!(
                        instance_id = %self.instance_id,
                        error = %error,
                        "relay subscription ended, retrying"
                    );
                }
                Err(error) => {
                    warn!(
                        instance_id = %self.instance_id,
                        error = %error,
                        retry_ms = self.retry_delay.as_millis() as u64,
                        "relay subscribe failed, retrying"
                    );
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn drain(&self, mut subscription: RelaySubscription) -> RelayError {
        loop {
            match subscription.next().await {
                Ok(RelayEvent::Frame(frame)) => self.deliver(frame).await,
                Ok(RelayEvent::Lagged(skipped)) => {
                    warn!(skipped, "relay listener lagged, frames were dropped");
                    metrics::relay_dropped(RelayDropReason::Lagged, skipped);
                }
                Ok(RelayEvent::Reconnected) => {
                    warn!("relay connection re-established, frames sent meanwhile were lost");
                    metrics::relay_dropped(RelayDropReason::Reconnect, 1);
                }
                Err(RelayError::Codec(error)) => {
                    warn!(error = %error, "dropping undecodable relay frame");
                    metrics::relay_dropped(RelayDropReason::Decode, 1);
                }
                Err(error) => return error,
            }
        }
    }

    async fn deliver(&self, frame: RelayFrame) {
        // The publishing instance already fanned out to its own connections.
        if frame.origin == self.instance_id {
            return;
        }
        if !self.registry.has_room(&frame.room_id).await {
            self.content_order.lock().await.remove(&frame.room_id);
            return;
        }

        match frame.body {
            RelayBody::Message { message: message @ ServerMessage::Content { .. } } => {
                let mut order = self.content_order.lock().await;
                *order.entry(frame.room_id.clone()).or_default() += 1;
                fan_out(&self.registry, &frame.room_id, &message).await;
            }
            RelayBody::Message { message } => {
                fan_out(&self.registry, &frame.room_id, &message).await;
            }
            RelayBody::ContentRef { edited_by } => {
                let sequence = {
                    let mut order = self.content_order.lock().await;
                    let latest = order.entry(frame.room_id.clone()).or_default();
                    *latest += 1;
                    *latest
                };
                // The store read runs on its own task so other rooms keep flowing.
                tokio::spawn(resolve_reference(
                    self.registry.clone(),
                    self.documents.clone(),
                    self.content_order.clone(),
                    frame.room_id,
                    edited_by,
                    sequence,
                ));
            }
        }
    }
}

/// Load the text behind a content reference and deliver it, unless a newer
/// content frame for the room was delivered while the load was in flight.
async fn resolve_reference(
    registry: Arc<ConnectionRegistry>,
    documents: DocumentStore,
    content_order: ContentOrder,
    room_id: String,
    edited_by: Option<String>,
    sequence: u64,
) {
    let data = match documents.load(&room_id).await {
        Ok(data) => data,
        Err(error) => {
            warn!(room_id = %room_id, error = ?error, "failed to resolve relayed content reference");
            metrics::relay_dropped(RelayDropReason::Resolve, 1);
            return;
        }
    };

    let order = content_order.lock().await;
    if order.get(&room_id) != Some(&sequence) {
        debug!(room_id = %room_id, "content reference superseded before it resolved");
        return;
    }
    fan_out(&registry, &room_id, &ServerMessage::Content { data, edited_by }).await;
}

async fn fan_out(registry: &ConnectionRegistry, room_id: &str, message: &ServerMessage) {
    let delivered = registry.broadcast(room_id, message, None).await;
    metrics::relay_received();
    debug!(room_id = %room_id, kind = message.kind(), delivered, "relayed frame delivered");
}

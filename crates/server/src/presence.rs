// Fleet-wide presence: which users are connected to which room.
//
// Membership is recorded per connection so a user with several tabs open
// stays present until the last one closes. Every row carries the id of the
// instance holding the connection, which lets an instance purge its own rows
// at startup and shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PresenceEntry {
    connection_id: Uuid,
    user_id: Uuid,
    instance_id: Uuid,
}

#[derive(Clone)]
enum PresenceBackend {
    Postgres(PgPool),
    /// Entries per room in connection order.
    Memory(Arc<RwLock<HashMap<String, Vec<PresenceEntry>>>>),
}

#[derive(Clone)]
pub struct PresenceSet {
    instance_id: Uuid,
    backend: PresenceBackend,
}

impl PresenceSet {
    pub fn postgres(pool: PgPool, instance_id: Uuid) -> Self {
        Self { instance_id, backend: PresenceBackend::Postgres(pool) }
    }

    pub fn memory(instance_id: Uuid) -> Self {
        Self { instance_id, backend: PresenceBackend::Memory(Arc::default()) }
    }

    /// A view of the same presence data as seen from another instance.
    pub fn for_instance(&self, instance_id: Uuid) -> Self {
        Self { instance_id, backend: self.backend.clone() }
    }

    pub async fn add(&self, room_id: &str, user_id: Uuid, connection_id: Uuid) -> anyhow::Result<()> {
        match &self.backend {
            PresenceBackend::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO room_presence (room_id, connection_id, user_id, instance_id)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (room_id, connection_id) DO NOTHING
                    "#,
                )
                .bind(room_id)
                .bind(connection_id)
                .bind(user_id)
                .bind(self.instance_id)
                .execute(pool)
                .await
                .context("failed to record room presence")?;
            }
            PresenceBackend::Memory(rooms) => {
                let mut guard = rooms.write().await;
                let entries = guard.entry(room_id.to_owned()).or_default();
                if !entries.iter().any(|entry| entry.connection_id == connection_id) {
                    entries.push(PresenceEntry {
                        connection_id,
                        user_id,
                        instance_id: self.instance_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Drop one connection's membership. Removing an absent entry is a no-op.
    pub async fn remove(
        &self,
        room_id: &str,
        user_id: Uuid,
        connection_id: Uuid,
    ) -> anyhow::Result<()> {
        match &self.backend {
            PresenceBackend::Postgres(pool) => {
                sqlx::query(
                    r#"
                    DELETE FROM room_presence
                    WHERE room_id = $1
                      AND connection_id = $2
                      AND user_id = $3
                    "#,
                )
                .bind(room_id)
                .bind(connection_id)
                .bind(user_id)
                .execute(pool)
                .await
                .context("failed to remove room presence")?;
            }
            PresenceBackend::Memory(rooms) => {
                let mut guard = rooms.write().await;
                if let Some(entries) = guard.get_mut(room_id) {
                    entries.retain(|entry| {
                        !(entry.connection_id == connection_id && entry.user_id == user_id)
                    });
                    if entries.is_empty() {
                        guard.remove(room_id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Distinct users present in the room, earliest arrival first.
    pub async fn members(&self, room_id: &str) -> anyhow::Result<Vec<Uuid>> {
        match &self.backend {
            PresenceBackend::Postgres(pool) => sqlx::query_scalar::<_, Uuid>(
                r#"
                SELECT user_id
                FROM room_presence
                WHERE room_id = $1
                GROUP BY user_id
                ORDER BY MIN(connected_at), user_id
                "#,
            )
            .bind(room_id)
            .fetch_all(pool)
            .await
            .context("failed to query room presence"),
            PresenceBackend::Memory(rooms) => {
                let guard = rooms.read().await;
                let mut members: Vec<Uuid> = Vec::new();
                for entry in guard.get(room_id).into_iter().flatten() {
                    if !members.contains(&entry.user_id) {
                        members.push(entry.user_id);
                    }
                }
                Ok(members)
            }
        }
    }

    /// Delete every row this instance owns. Returns the rooms that lost
    /// rows, each once, so callers can re-announce their member lists.
    pub async fn purge_instance(&self) -> anyhow::Result<Vec<String>> {
        match &self.backend {
            PresenceBackend::Postgres(pool) => {
                let mut rooms = sqlx::query_scalar::<_, String>(
                    "DELETE FROM room_presence WHERE instance_id = $1 RETURNING room_id",
                )
                .bind(self.instance_id)
                .fetch_all(pool)
                .await
                .context("failed to purge instance presence")?;
                rooms.sort();
                rooms.dedup();
                Ok(rooms)
            }
            PresenceBackend::Memory(rooms) => {
                let mut guard = rooms.write().await;
                let mut affected = Vec::new();
                for (room_id, entries) in guard.iter_mut() {
                    let before = entries.len();
                    entries.retain(|entry| entry.instance_id != self.instance_id);
                    if entries.len() != before {
                        affected.push(room_id.clone());
                    }
                }
                guard.retain(|_, entries| !entries.is_empty());
                affected.sort();
                Ok(affected)
            }
        }
    }
}

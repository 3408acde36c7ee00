// Room access: role resolution and username lookup.
//
// Roles live in `room_members`, display names in `users`. The server only
// reads them; administering either table belongs to other services. The
// write helpers exist for the in-memory backend and for test fixtures.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use syncroom_common::types::{PresenceUser, Role};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone)]
pub enum AccessGate {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryAccess>>),
}

#[derive(Debug, Default)]
pub struct MemoryAccess {
    roles: HashMap<(String, Uuid), Role>,
    usernames: HashMap<Uuid, String>,
}

impl AccessGate {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryAccess::default())))
    }

    /// Role the user holds on the room, or `None` when they have no access.
    pub async fn resolve_role(&self, room_id: &str, user_id: Uuid) -> anyhow::Result<Option<Role>> {
        match self {
            Self::Postgres(pool) => {
                let role = sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT role
                    FROM room_members
                    WHERE room_id = $1
                      AND user_id = $2
                    "#,
                )
                .bind(room_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to query room role")?
                .map(|role| {
                    Role::from_db_value(&role)
                        .ok_or_else(|| anyhow::anyhow!("invalid room role '{role}' in database"))
                })
                .transpose()?;

                Ok(role)
            }
            Self::Memory(store) => {
                Ok(store.read().await.roles.get(&(room_id.to_owned(), user_id)).copied())
            }
        }
    }

    /// Resolve display names for `user_ids`, keeping their order. Users
    /// without a resolvable name are left out.
    pub async fn usernames_for(&self, user_ids: &[Uuid]) -> anyhow::Result<Vec<PresenceUser>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let names: HashMap<Uuid, String> = match self {
            Self::Postgres(pool) => sqlx::query_as::<_, (Uuid, String)>(
                "SELECT id, username FROM users WHERE id = ANY($1)",
            )
            .bind(user_ids)
            .fetch_all(pool)
            .await
            .context("failed to query usernames")?
            .into_iter()
            .collect(),
            Self::Memory(store) => {
                let guard = store.read().await;
                user_ids
                    .iter()
                    .filter_map(|id| guard.usernames.get(id).map(|name| (*id, name.clone())))
                    .collect()
            }
        };

        Ok(user_ids
            .iter()
            .filter_map(|id| {
                names.get(id).map(|username| PresenceUser { user_id: *id, username: username.clone() })
            })
            .collect())
    }

    pub async fn register_user(&self, user_id: Uuid, username: &str) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO users (id, username)
                    VALUES ($1, $2)
                    ON CONFLICT (id) DO UPDATE SET username = EXCLUDED.username
                    "#,
                )
                .bind(user_id)
                .bind(username)
                .execute(pool)
                .await
                .context("failed to upsert user")?;
            }
            Self::Memory(store) => {
                store.write().await.usernames.insert(user_id, username.to_owned());
            }
        }
        Ok(())
    }

    pub async fn grant(&self, room_id: &str, user_id: Uuid, role: Role) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO room_members (room_id, user_id, role)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (room_id, user_id) DO UPDATE SET role = EXCLUDED.role
                    "#,
                )
                .bind(room_id)
                .bind(user_id)
                .bind(role.as_str())
                .execute(pool)
                .await
                .context("failed to upsert room membership")?;
            }
            Self::Memory(store) => {
                store.write().await.roles.insert((room_id.to_owned(), user_id), role);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::AccessGate;
    use syncroom_common::types::Role;
    use uuid::Uuid;

    #[tokio::test]
    async fn ungranted_user_has_no_role() {
        let gate = AccessGate::memory();
        let role = gate.resolve_role("alice/notes", Uuid::new_v4()).await.expect("lookup");
        assert_eq!(role, None);
    }

    #[tokio::test]
    async fn grants_are_scoped_to_the_room() {
        let gate = AccessGate::memory();
        let user_id = Uuid::new_v4();
        gate.grant("alice/notes", user_id, Role::Viewer).await.expect("grant");

        assert_eq!(
            gate.resolve_role("alice/notes", user_id).await.expect("lookup"),
            Some(Role::Viewer)
        );
        assert_eq!(gate.resolve_role("alice/other", user_id).await.expect("lookup"), None);

        gate.grant("alice/notes", user_id, Role::Editor).await.expect("regrant");
        assert_eq!(
            gate.resolve_role("alice/notes", user_id).await.expect("lookup"),
            Some(Role::Editor)
        );
    }

    #[tokio::test]
    async fn usernames_keep_input_order_and_skip_unknown_users() {
        let gate = AccessGate::memory();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let ghost = Uuid::new_v4();
        gate.register_user(alice, "alice").await.expect("register");
        gate.register_user(bob, "bob").await.expect("register");

        let users = gate.usernames_for(&[bob, ghost, alice]).await.expect("lookup");
        let names: Vec<_> = users.iter().map(|user| user.username.as_str()).collect();
        assert_eq!(names, ["bob", "alice"]);
        assert_eq!(users[0].user_id, bob);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;

/// Persisted room documents. The stored text is authoritative: every new
/// connection receives it as its snapshot.
#[derive(Clone)]
pub enum DocumentStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<String, StoredDocument>>>),
    /// Fails every call. Lets tests drive the persistence-failure path.
    #[cfg(test)]
    Unavailable,
    /// In-memory store whose loads wait for a permit on `open`.
    #[cfg(test)]
    Gated {
        documents: Arc<RwLock<HashMap<String, StoredDocument>>>,
        open: Arc<tokio::sync::Notify>,
    },
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

impl DocumentStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// A gated store and the handle that releases one pending load per
    /// permit.
    #[cfg(test)]
    pub(crate) fn gated() -> (Self, Arc<tokio::sync::Notify>) {
        let open = Arc::new(tokio::sync::Notify::new());
        (Self::Gated { documents: Arc::default(), open: open.clone() }, open)
    }

    /// Current text of the room. Unknown rooms read as empty without a row
    /// being created.
    pub async fn load(&self, room_id: &str) -> anyhow::Result<String> {
        match self {
            Self::Postgres(pool) => {
                let content = sqlx::query_scalar::<_, String>(
                    "SELECT content FROM documents WHERE room_id = $1",
                )
                .bind(room_id)
                .fetch_optional(pool)
                .await
                .with_context(|| format!("failed to load document for room '{room_id}'"))?;

                Ok(content.unwrap_or_default())
            }
            Self::Memory(documents) => Ok(read_memory(documents, room_id).await),
            #[cfg(test)]
            Self::Unavailable => anyhow::bail!("document store is unavailable"),
            #[cfg(test)]
            Self::Gated { documents, open } => {
                open.notified().await;
                Ok(read_memory(documents, room_id).await)
            }
        }
    }

    /// Replace the room's text and stamp it with the current time.
    pub async fn save(&self, room_id: &str, content: &str) -> anyhow::Result<DateTime<Utc>> {
        let now = Utc::now();
        match self {
            Self::Postgres(pool) => {
                let updated_at = sqlx::query_scalar::<_, DateTime<Utc>>(
                    r#"
                    INSERT INTO documents (room_id, content, updated_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (room_id)
                    DO UPDATE SET content = EXCLUDED.content, updated_at = EXCLUDED.updated_at
                    RETURNING updated_at
                    "#,
                )
                .bind(room_id)
                .bind(content)
                .bind(now)
                .fetch_one(pool)
                .await
                .with_context(|| format!("failed to save document for room '{room_id}'"))?;

                Ok(updated_at)
            }
            Self::Memory(documents) => {
                write_memory(documents, room_id, content, now).await;
                Ok(now)
            }
            #[cfg(test)]
            Self::Unavailable => anyhow::bail!("document store is unavailable"),
            #[cfg(test)]
            Self::Gated { documents, .. } => {
                write_memory(documents, room_id, content, now).await;
                Ok(now)
            }
        }
    }
}

async fn read_memory(documents: &RwLock<HashMap<String, StoredDocument>>, room_id: &str) -> String {
    documents.read().await.get(room_id).map(|document| document.content.clone()).unwrap_or_default()
}

async fn write_memory(
    documents: &RwLock<HashMap<String, StoredDocument>>,
    room_id: &str,
    content: &str,
    updated_at: DateTime<Utc>,
) {
    documents
        .write()
        .await
        .insert(room_id.to_owned(), StoredDocument { content: content.to_owned(), updated_at });
}

#[cfg(test)]
mod tests {
    use super::DocumentStore;

    #[tokio::test]
    async fn unknown_room_loads_as_empty_without_creating_it() {
        let store = DocumentStore::memory();
        assert_eq!(store.load("nobody/nothing").await.expect("load"), "");

        let DocumentStore::Memory(documents) = &store else {
            panic!("expected memory store");
        };
        assert!(documents.read().await.is_empty());
    }

    #[tokio::test]
    async fn last_save_wins() {
        let store = DocumentStore::memory();
        let first = store.save("alice/notes", "E1").await.expect("save");
        let second = store.save("alice/notes", "E2").await.expect("save");

        assert!(second >= first);
        assert_eq!(store.load("alice/notes").await.expect("load"), "E2");
    }

    #[tokio::test]
    async fn rooms_are_independent() {
        let store = DocumentStore::memory();
        store.save("alice/a", "alpha").await.expect("save");
        store.save("alice/b", "beta").await.expect("save");

        assert_eq!(store.load("alice/a").await.expect("load"), "alpha");
        assert_eq!(store.load("alice/b").await.expect("load"), "beta");
    }

    #[tokio::test]
    async fn unavailable_store_fails_both_operations() {
        let store = DocumentStore::Unavailable;
        assert!(store.load("alice/notes").await.is_err());
        assert!(store.save("alice/notes", "text").await.is_err());
    }
}

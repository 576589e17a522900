//! Durable user/agent profile facts: a flat key-value map with confidence,
//! provenance, and optional expiry.

use rusqlite::{params, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{MemoryError, Result};
use crate::schema::{now_ms, ProfileItem, ProfileSetInput};

#[derive(Clone)]
pub struct ProfileStore {
    db: Db,
}

impl ProfileStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Upsert. A later `set` on the same key always wins regardless of
    /// confidence — conflict policy is the write-policy layer's concern, not
    /// the store's.
    pub fn set(&self, input: ProfileSetInput) -> Result<ProfileItem> {
        if input.key.trim().is_empty() {
            return Err(MemoryError::Invalid("profile key must not be empty".into()));
        }

        let item = ProfileItem {
            key: input.key,
            value: input.value,
            updated_at: now_ms(),
            confidence: input.confidence.clamp(0.0, 1.0),
            source_event_id: input.source_event_id,
            explicit: input.explicit,
            expires_at: input.expires_at,
        };

        self.db.with(|conn| {
            let value = serde_json::to_string(&item.value)?;
            conn.execute(
                "INSERT INTO profile (key, value, updated_at, confidence, source_event_id, explicit, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at,
                    confidence = excluded.confidence,
                    source_event_id = excluded.source_event_id,
                    explicit = excluded.explicit,
                    expires_at = excluded.expires_at",
                params![
                    item.key,
                    value,
                    item.updated_at,
                    item.confidence,
                    item.source_event_id.map(|id| id.to_string()),
                    item.explicit,
                    item.expires_at,
                ],
            )
            .map_err(|e| MemoryError::database("profile upsert", e))?;
            Ok(())
        })?;

        debug!(key = %item.key, confidence = item.confidence, "profile item set");
        Ok(item)
    }

    pub fn get(&self, key: &str) -> Result<Option<ProfileItem>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT key, value, updated_at, confidence, source_event_id, explicit, expires_at
                 FROM profile WHERE key = ?1",
                params![key],
                row_to_item,
            )
            .optional()
            .map_err(MemoryError::from)
        })
    }

    /// All non-expired items, ordered by key.
    pub fn get_all(&self) -> Result<Vec<ProfileItem>> {
        self.db.with(|conn| {
            let now = now_ms();
            let mut stmt = conn.prepare(
                "SELECT key, value, updated_at, confidence, source_event_id, explicit, expires_at
                 FROM profile WHERE expires_at IS NULL OR expires_at > ?1
                 ORDER BY key ASC",
            )?;
            let rows = stmt
                .query_map(params![now], row_to_item)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.db.with(|conn| {
            let n = conn.execute("DELETE FROM profile WHERE key = ?1", params![key])?;
            Ok(n > 0)
        })
    }

    pub fn get_by_source_event(&self, source_event_id: Uuid) -> Result<Vec<ProfileItem>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value, updated_at, confidence, source_event_id, explicit, expires_at
                 FROM profile WHERE source_event_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![source_event_id.to_string()], row_to_item)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<ProfileItem> {
    let value: String = row.get(1)?;
    let source_event_id: Option<String> = row.get(4)?;
    Ok(ProfileItem {
        key: row.get(0)?,
        value: serde_json::from_str(&value).unwrap_or(serde_json::Value::Null),
        updated_at: row.get(2)?,
        confidence: row.get(3)?,
        source_event_id: source_event_id.and_then(|s| Uuid::parse_str(&s).ok()),
        explicit: row.get(5)?,
        expires_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ProfileStore {
        ProfileStore::new(Db::open_in_memory().unwrap())
    }

    fn input(key: &str, value: serde_json::Value) -> ProfileSetInput {
        ProfileSetInput { key: key.into(), value, confidence: 0.9, source_event_id: None, explicit: true, expires_at: None }
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = store();
        store.set(input("name", json!("Ada"))).unwrap();
        let item = store.get("name").unwrap().unwrap();
        assert_eq!(item.value, json!("Ada"));
    }

    #[test]
    fn set_is_an_upsert() {
        let store = store();
        store.set(input("name", json!("Ada"))).unwrap();
        store.set(input("name", json!("Grace"))).unwrap();
        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, json!("Grace"));
    }

    #[test]
    fn expired_items_excluded_from_get_all() {
        let store = store();
        let mut expired = input("stale", json!(true));
        expired.expires_at = Some(1);
        store.set(expired).unwrap();
        store.set(input("fresh", json!(true))).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "fresh");
    }

    #[test]
    fn rejects_empty_key() {
        let store = store();
        let err = store.set(input("", json!(1))).unwrap_err();
        assert!(matches!(err, MemoryError::Invalid(_)));
    }

    #[test]
    fn delete_removes_key() {
        let store = store();
        store.set(input("a", json!(1))).unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.has("a").unwrap());
        assert!(!store.delete("a").unwrap());
    }
}

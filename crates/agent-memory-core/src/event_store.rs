//! Episodic event store: `add`, `add_batch`, `query`, `get_recent`, and the
//! three deletion shapes (`delete`, `delete_by_session`, `delete_before`).
//!
//! Batch writes run inside one `rusqlite` transaction so a crash mid-batch
//! never leaves a partial write visible.

use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::{check_cancelled, CancellationToken};
use crate::db::Db;
use crate::error::{MemoryError, Result};
use crate::schema::{Event, EventEntity, EventInput, EventLink, EventQuery, EventType, EVENT_SUMMARY_MAX_CHARS, now_ms, dedupe_tags};

#[derive(Clone)]
pub struct EventStore {
    db: Db,
}

impl EventStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    fn validate(input: &EventInput) -> Result<()> {
        if input.summary.trim().is_empty() {
            return Err(MemoryError::Invalid("event summary must not be empty".into()));
        }
        if input.summary.chars().count() > EVENT_SUMMARY_MAX_CHARS {
            return Err(MemoryError::Invalid(format!(
                "event summary exceeds {EVENT_SUMMARY_MAX_CHARS} characters"
            )));
        }
        Ok(())
    }

    fn materialise(input: EventInput) -> Result<Event> {
        Self::validate(&input)?;
        Ok(Event {
            id: Uuid::new_v4(),
            timestamp: now_ms(),
            event_type: input.event_type.unwrap_or(EventType::System),
            session_id: input.session_id,
            intent: input.intent,
            summary: input.summary,
            entities: input.entities,
            links: input.links,
            payload: input.payload,
            parent_id: input.parent_id,
            tags: dedupe_tags(input.tags),
        })
    }

    pub fn add(&self, input: EventInput) -> Result<Event> {
        let event = Self::materialise(input)?;
        self.db.with(|conn| {
            check_parent_exists(conn, event.parent_id)?;
            insert_event(conn, &event)?;
            Ok(())
        })?;
        debug!(id = %event.id, event_type = event.event_type.as_str(), "event recorded");
        Ok(event)
    }

    /// Insert every event in one transaction: either all rows land, or none
    /// do, matching the atomicity contract for batch inserts.
    ///
    /// `cancel`, if given, is checked before each row; a cancellation
    /// between sub-steps rolls back the whole transaction (it is never
    /// committed) and the call returns `Err(MemoryError::Cancelled)`.
    pub fn add_batch(&self, inputs: Vec<EventInput>, cancel: Option<&CancellationToken>) -> Result<Vec<Event>> {
        let events: Vec<Event> = inputs
            .into_iter()
            .map(Self::materialise)
            .collect::<Result<_>>()?;

        self.db.with(|conn| {
            let tx = conn.unchecked_transaction().map_err(MemoryError::from)?;
            for event in &events {
                check_cancelled(cancel)?;
                check_parent_exists(&tx, event.parent_id)?;
                insert_event(&tx, event)?;
            }
            tx.commit().map_err(MemoryError::from)?;
            Ok(())
        })?;
        debug!(count = events.len(), "event batch recorded");
        Ok(events)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Event>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT id, timestamp, event_type, session_id, intent, summary, entities, links, payload, parent_id, tags
                 FROM events WHERE id = ?1",
                params![id.to_string()],
                row_to_event,
            )
            .optional()
            .map_err(MemoryError::from)
        })
    }

    /// Ascending by timestamp.
    pub fn query(&self, query: EventQuery) -> Result<Vec<Event>> {
        self.db.with(|conn| {
            let mut sql = String::from(
                "SELECT id, timestamp, event_type, session_id, intent, summary, entities, links, payload, parent_id, tags FROM events WHERE 1=1",
            );
            let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(session_id) = &query.session_id {
                sql.push_str(" AND session_id = ?");
                binds.push(Box::new(session_id.clone()));
            }
            if let Some(types) = &query.types {
                let placeholders = vec!["?"; types.len()].join(",");
                sql.push_str(&format!(" AND event_type IN ({placeholders})"));
                for t in types {
                    binds.push(Box::new(t.as_str().to_string()));
                }
            }
            if let Some(since) = query.since {
                sql.push_str(" AND timestamp >= ?");
                binds.push(Box::new(since));
            }
            if let Some(until) = query.until {
                sql.push_str(" AND timestamp <= ?");
                binds.push(Box::new(until));
            }
            sql.push_str(" ORDER BY timestamp ASC");
            if let Some(limit) = query.limit {
                sql.push_str(" LIMIT ?");
                binds.push(Box::new(limit as i64));
                if let Some(offset) = query.offset {
                    sql.push_str(" OFFSET ?");
                    binds.push(Box::new(offset as i64));
                }
            }

            let mut stmt = conn.prepare(&sql)?;
            let bind_refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(bind_refs.as_slice(), row_to_event)?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }

            // Tag filtering is post-hoc: tags are stored as a JSON array and
            // SQLite has no native set-membership operator we want to rely
            // on here.
            if let Some(tags) = &query.tags {
                events.retain(|e| tags.iter().any(|t| e.tags.contains(t)));
            }

            Ok(events)
        })
    }

    /// Newest-first, bounded by `limit`.
    pub fn get_recent(&self, limit: usize, session_id: Option<&str>) -> Result<Vec<Event>> {
        self.db.with(|conn| {
            let (sql, bind_session);
            if let Some(sid) = session_id {
                sql = "SELECT id, timestamp, event_type, session_id, intent, summary, entities, links, payload, parent_id, tags
                       FROM events WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT ?2";
                bind_session = Some(sid.to_string());
            } else {
                sql = "SELECT id, timestamp, event_type, session_id, intent, summary, entities, links, payload, parent_id, tags
                       FROM events ORDER BY timestamp DESC LIMIT ?1";
                bind_session = None;
            }

            let mut stmt = conn.prepare(sql)?;
            let rows = if let Some(sid) = bind_session {
                stmt.query_map(params![sid, limit as i64], row_to_event)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            } else {
                stmt.query_map(params![limit as i64], row_to_event)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            Ok(rows)
        })
    }

    pub fn count(&self, session_id: Option<&str>) -> Result<usize> {
        self.db.with(|conn| {
            let n: i64 = if let Some(sid) = session_id {
                conn.query_row("SELECT COUNT(*) FROM events WHERE session_id = ?1", params![sid], |r| r.get(0))?
            } else {
                conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?
            };
            Ok(n as usize)
        })
    }

    pub fn delete(&self, id: Uuid) -> Result<bool> {
        self.db.with(|conn| {
            let n = conn.execute("DELETE FROM events WHERE id = ?1", params![id.to_string()])?;
            Ok(n > 0)
        })
    }

    pub fn delete_batch(&self, ids: &[Uuid]) -> Result<usize> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction().map_err(MemoryError::from)?;
            let mut deleted = 0usize;
            for id in ids {
                deleted += tx.execute("DELETE FROM events WHERE id = ?1", params![id.to_string()])?;
            }
            tx.commit().map_err(MemoryError::from)?;
            Ok(deleted)
        })
    }

    pub fn delete_by_session(&self, session_id: &str) -> Result<usize> {
        self.db.with(|conn| {
            Ok(conn.execute("DELETE FROM events WHERE session_id = ?1", params![session_id])?)
        })
    }

    pub fn delete_before(&self, timestamp: i64) -> Result<usize> {
        self.db.with(|conn| {
            Ok(conn.execute("DELETE FROM events WHERE timestamp < ?1", params![timestamp])?)
        })
    }
}

/// Invariant: "`parent_id` if present refers to an existing event."
fn check_parent_exists(conn: &rusqlite::Connection, parent_id: Option<Uuid>) -> Result<()> {
    let Some(parent_id) = parent_id else {
        return Ok(());
    };
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM events WHERE id = ?1",
            params![parent_id.to_string()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !exists {
        return Err(MemoryError::NotFound(format!("parent event {parent_id}")));
    }
    Ok(())
}

fn insert_event(conn: &rusqlite::Connection, event: &Event) -> Result<()> {
    let entities = serde_json::to_string(&event.entities)?;
    let links = serde_json::to_string(&event.links)?;
    let payload = serde_json::to_string(&event.payload)?;
    let tags = serde_json::to_string(&event.tags)?;

    let result = conn.execute(
        "INSERT INTO events (id, timestamp, event_type, session_id, intent, summary, entities, links, payload, parent_id, tags)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event.id.to_string(),
            event.timestamp,
            event.event_type.as_str(),
            event.session_id,
            event.intent,
            event.summary,
            entities,
            links,
            payload,
            event.parent_id.map(|p| p.to_string()),
            tags,
        ],
    );
    if let Err(err) = result {
        warn!(id = %event.id, %err, "failed to persist event");
        return Err(MemoryError::database("event insert", err));
    }
    Ok(())
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let id: String = row.get(0)?;
    let event_type: String = row.get(2)?;
    let parent_id: Option<String> = row.get(9)?;
    let entities: String = row.get(6)?;
    let links: String = row.get(7)?;
    let payload: String = row.get(8)?;
    let tags: String = row.get(10)?;

    Ok(Event {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        timestamp: row.get(1)?,
        event_type: EventType::from_str_opt(&event_type).unwrap_or(EventType::System),
        session_id: row.get(3)?,
        intent: row.get(4)?,
        summary: row.get(5)?,
        entities: serde_json::from_str::<Vec<EventEntity>>(&entities).unwrap_or_default(),
        links: serde_json::from_str::<Vec<EventLink>>(&links).unwrap_or_default(),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        parent_id: parent_id.and_then(|p| Uuid::parse_str(&p).ok()),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EventStore {
        EventStore::new(Db::open_in_memory().unwrap())
    }

    fn input(summary: &str) -> EventInput {
        EventInput {
            event_type: Some(EventType::UserMsg),
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let store = store();
        let added = store.add(input("hello")).unwrap();
        let fetched = store.get(added.id).unwrap().unwrap();
        assert_eq!(fetched.summary, "hello");
        assert_eq!(fetched.id, added.id);
    }

    #[test]
    fn empty_summary_is_rejected() {
        let store = store();
        let err = store.add(input("")).unwrap_err();
        assert!(matches!(err, MemoryError::Invalid(_)));
    }

    #[test]
    fn batch_insert_is_atomic_and_ordered() {
        let store = store();
        let events = store
            .add_batch(vec![input("a"), input("b"), input("c")], None)
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(store.count(None).unwrap(), 3);
    }

    #[test]
    fn cancelled_batch_insert_commits_nothing() {
        let store = store();
        let token = CancellationToken::new();
        token.cancel();
        let err = store
            .add_batch(vec![input("a"), input("b")], Some(&token))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Cancelled));
        assert_eq!(store.count(None).unwrap(), 0);
    }

    #[test]
    fn get_recent_is_newest_first() {
        let store = store();
        store.add(input("first")).unwrap();
        store.add(input("second")).unwrap();
        let recent = store.get_recent(10, None).unwrap();
        assert_eq!(recent[0].summary, "second");
        assert_eq!(recent[1].summary, "first");
    }

    #[test]
    fn query_defaults_to_ascending() {
        let store = store();
        store.add(input("first")).unwrap();
        store.add(input("second")).unwrap();
        let results = store.query(EventQuery::default()).unwrap();
        assert_eq!(results[0].summary, "first");
        assert_eq!(results[1].summary, "second");
    }

    #[test]
    fn delete_by_session_removes_only_that_session() {
        let store = store();
        store
            .add(EventInput {
                session_id: Some("s1".into()),
                ..input("one")
            })
            .unwrap();
        store
            .add(EventInput {
                session_id: Some("s2".into()),
                ..input("two")
            })
            .unwrap();
        let removed = store.delete_by_session("s1").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count(None).unwrap(), 1);
    }

    #[test]
    fn unknown_parent_id_is_rejected() {
        let store = store();
        let err = store
            .add(EventInput {
                parent_id: Some(Uuid::new_v4()),
                ..input("orphan")
            })
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[test]
    fn existing_parent_id_is_accepted() {
        let store = store();
        let parent = store.add(input("parent")).unwrap();
        let child = store
            .add(EventInput {
                parent_id: Some(parent.id),
                ..input("child")
            })
            .unwrap();
        assert_eq!(child.parent_id, Some(parent.id));
    }

    #[test]
    fn tags_are_deduplicated() {
        let store = store();
        let event = store
            .add(EventInput {
                tags: ["a".to_string(), "a".to_string(), "b".to_string()].into_iter().collect(),
                ..input("tagged")
            })
            .unwrap();
        assert_eq!(event.tags.len(), 2);
    }
}

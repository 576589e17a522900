//! Append-only summary store.
//!
//! Summaries are immutable once written — callers add a new one rather than
//! editing an old one. Plain insert, JSON text columns, newest-first reads.

use rusqlite::{params, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{MemoryError, Result};
use crate::schema::{now_ms, Decision, Summary, SummaryInput, Todo};

#[derive(Clone)]
pub struct SummaryStore {
    db: Db,
}

impl SummaryStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn add(&self, input: SummaryInput) -> Result<Summary> {
        if input.short.trim().is_empty() {
            return Err(MemoryError::Invalid("summary.short must not be empty".into()));
        }

        let summary = Summary {
            id: Uuid::new_v4(),
            timestamp: now_ms(),
            session_id: input.session_id,
            short: input.short,
            bullets: input.bullets,
            decisions: input.decisions,
            todos: input.todos,
            covered_event_ids: input.covered_event_ids,
            token_count: input.token_count,
        };

        self.db.with(|conn| insert_summary(conn, &summary))?;
        debug!(summary_id = %summary.id, session_id = %summary.session_id, "summary recorded");
        Ok(summary)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Summary>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT id, timestamp, session_id, short, bullets, decisions, todos, covered_event_ids, token_count
                 FROM summaries WHERE id = ?1",
                params![id.to_string()],
                row_to_summary,
            )
            .optional()
            .map_err(MemoryError::from)
        })
    }

    pub fn get_latest(&self, session_id: &str) -> Result<Option<Summary>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT id, timestamp, session_id, short, bullets, decisions, todos, covered_event_ids, token_count
                 FROM summaries WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![session_id],
                row_to_summary,
            )
            .optional()
            .map_err(MemoryError::from)
        })
    }

    pub fn list(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<Summary>> {
        self.db.with(|conn| {
            let limit = limit.unwrap_or(usize::MAX) as i64;
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, session_id, short, bullets, decisions, todos, covered_event_ids, token_count
                 FROM summaries WHERE session_id = ?1 ORDER BY timestamp ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![session_id, limit], row_to_summary)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn insert_summary(conn: &rusqlite::Connection, summary: &Summary) -> Result<()> {
    let bullets = serde_json::to_string(&summary.bullets)?;
    let decisions = serde_json::to_string(&summary.decisions)?;
    let todos = serde_json::to_string(&summary.todos)?;
    let covered = serde_json::to_string(&summary.covered_event_ids)?;

    conn.execute(
        "INSERT INTO summaries (id, timestamp, session_id, short, bullets, decisions, todos, covered_event_ids, token_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            summary.id.to_string(),
            summary.timestamp,
            summary.session_id,
            summary.short,
            bullets,
            decisions,
            todos,
            covered,
            summary.token_count,
        ],
    )
    .map_err(|e| MemoryError::database("summary insert", e))?;
    Ok(())
}

fn row_to_summary(row: &rusqlite::Row) -> rusqlite::Result<Summary> {
    let id: String = row.get(0)?;
    let bullets: String = row.get(4)?;
    let decisions: String = row.get(5)?;
    let todos: String = row.get(6)?;
    let covered: String = row.get(7)?;

    Ok(Summary {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        timestamp: row.get(1)?,
        session_id: row.get(2)?,
        short: row.get(3)?,
        bullets: serde_json::from_str(&bullets).unwrap_or_default(),
        decisions: serde_json::from_str::<Vec<Decision>>(&decisions).unwrap_or_default(),
        todos: serde_json::from_str::<Vec<Todo>>(&todos).unwrap_or_default(),
        covered_event_ids: serde_json::from_str(&covered).unwrap_or_default(),
        token_count: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SummaryStore {
        SummaryStore::new(Db::open_in_memory().unwrap())
    }

    #[test]
    fn rejects_empty_short() {
        let store = store();
        let err = store
            .add(SummaryInput { session_id: "s1".into(), short: "  ".into(), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, MemoryError::Invalid(_)));
    }

    #[test]
    fn get_latest_returns_newest() {
        let store = store();
        store.add(SummaryInput { session_id: "s1".into(), short: "first".into(), ..Default::default() }).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.add(SummaryInput { session_id: "s1".into(), short: "second".into(), ..Default::default() }).unwrap();

        let latest = store.get_latest("s1").unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[test]
    fn list_is_session_scoped_and_chronological() {
        let store = store();
        store.add(SummaryInput { session_id: "a".into(), short: "one".into(), ..Default::default() }).unwrap();
        store.add(SummaryInput { session_id: "b".into(), short: "other session".into(), ..Default::default() }).unwrap();
        store.add(SummaryInput { session_id: "a".into(), short: "two".into(), ..Default::default() }).unwrap();

        let list = store.list("a", None).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].short, "one");
        assert_eq!(list[1].short, "two");
    }
}

//! Shared `rusqlite` connection and schema/migration guard.
//!
//! One `Connection` behind a mutex, `PRAGMA user_version` as the migration
//! marker, `execute_batch` for DDL. WAL mode and foreign keys are enabled
//! on every open so concurrent readers don't block a writer and referential
//! integrity is enforced by SQLite itself rather than in application code.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::Result;

/// Schema version. Bump when changing table definitions; `init_schema` drops
/// and recreates all tables on mismatch since the store is a cache/working
/// set, not an archival format.
pub const SCHEMA_VERSION: i32 = 1;

/// Thread-safe handle to the single backing `rusqlite::Connection` shared by
/// every store owned by one `MemoryManager`.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(())
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current_version != 0 && current_version != SCHEMA_VERSION {
        drop_all_tables(conn)?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            session_id TEXT,
            intent TEXT,
            summary TEXT NOT NULL,
            entities TEXT NOT NULL,
            links TEXT NOT NULL,
            payload TEXT NOT NULL,
            parent_id TEXT,
            tags TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events(session_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            goal TEXT NOT NULL,
            status TEXT NOT NULL,
            constraints TEXT NOT NULL,
            plan TEXT NOT NULL,
            done TEXT NOT NULL,
            blocked TEXT NOT NULL,
            next_action TEXT,
            updated_at INTEGER NOT NULL,
            version INTEGER NOT NULL,
            session_id TEXT,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_session_updated ON tasks(session_id, updated_at);

        CREATE TABLE IF NOT EXISTS task_snapshots (
            task_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            state TEXT NOT NULL,
            recorded_at INTEGER NOT NULL,
            PRIMARY KEY (task_id, version)
        );

        CREATE TABLE IF NOT EXISTS task_actions (
            task_id TEXT NOT NULL,
            action_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            recorded_at INTEGER NOT NULL,
            PRIMARY KEY (task_id, action_id)
        );

        CREATE TABLE IF NOT EXISTS summaries (
            id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            short TEXT NOT NULL,
            bullets TEXT NOT NULL,
            decisions TEXT NOT NULL,
            todos TEXT NOT NULL,
            covered_event_ids TEXT NOT NULL,
            token_count INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_summaries_session_ts ON summaries(session_id, timestamp);

        CREATE TABLE IF NOT EXISTS profile (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            confidence REAL NOT NULL,
            source_event_id TEXT,
            explicit INTEGER NOT NULL,
            expires_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS chunks (
            rowid INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            timestamp INTEGER NOT NULL,
            text TEXT NOT NULL,
            tags TEXT NOT NULL,
            source_event_id TEXT,
            source_type TEXT,
            session_id TEXT,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_session ON chunks(session_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            text, tags, content='chunks', content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, text, tags) VALUES (new.rowid, new.text, new.tags);
        END;
        CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, text, tags) VALUES ('delete', old.rowid, old.text, old.tags);
        END;
        CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, text, tags) VALUES ('delete', old.rowid, old.text, old.tags);
            INSERT INTO chunks_fts(rowid, text, tags) VALUES (new.rowid, new.text, new.tags);
        END;

        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS tree_roots (
            id TEXT PRIMARY KEY,
            tree_type TEXT NOT NULL,
            name TEXT NOT NULL,
            root_path TEXT NOT NULL,
            metadata TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tree_nodes (
            id TEXT PRIMARY KEY,
            tree_type TEXT NOT NULL,
            tree_root_id TEXT NOT NULL,
            node_type TEXT NOT NULL,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            depth INTEGER NOT NULL,
            parent_id TEXT,
            sort_order INTEGER NOT NULL,
            chunk_id TEXT,
            metadata TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (tree_root_id) REFERENCES tree_roots(id) ON DELETE CASCADE,
            UNIQUE (tree_root_id, path)
        );
        CREATE INDEX IF NOT EXISTS idx_tree_nodes_chunk ON tree_nodes(chunk_id);
        CREATE INDEX IF NOT EXISTS idx_tree_nodes_root ON tree_nodes(tree_root_id);

        CREATE TABLE IF NOT EXISTS tree_closure (
            ancestor_id TEXT NOT NULL,
            descendant_id TEXT NOT NULL,
            depth INTEGER NOT NULL,
            PRIMARY KEY (ancestor_id, descendant_id),
            FOREIGN KEY (ancestor_id) REFERENCES tree_nodes(id) ON DELETE CASCADE,
            FOREIGN KEY (descendant_id) REFERENCES tree_nodes(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_closure_descendant ON tree_closure(descendant_id);
        "#,
    )?;

    conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
    Ok(())
}

fn drop_all_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS tree_closure;
        DROP TABLE IF EXISTS tree_nodes;
        DROP TABLE IF EXISTS tree_roots;
        DROP TABLE IF EXISTS chunk_vectors;
        DROP TRIGGER IF EXISTS chunks_ai;
        DROP TRIGGER IF EXISTS chunks_ad;
        DROP TRIGGER IF EXISTS chunks_au;
        DROP TABLE IF EXISTS chunks_fts;
        DROP TABLE IF EXISTS chunks;
        DROP TABLE IF EXISTS profile;
        DROP TABLE IF EXISTS summaries;
        DROP TABLE IF EXISTS task_actions;
        DROP TABLE IF EXISTS task_snapshots;
        DROP TABLE IF EXISTS tasks;
        DROP TABLE IF EXISTS events;
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_and_sets_pragmas() {
        let db = Db::open_in_memory().expect("open");
        db.with(|conn| {
            let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?;
            assert_eq!(fk, 1);
            Ok(())
        })
        .expect("pragma check");
    }

    #[test]
    fn reopen_keeps_schema_version() {
        let db = Db::open_in_memory().expect("open");
        db.with(|conn| {
            let v: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
            assert_eq!(v, SCHEMA_VERSION);
            Ok(())
        })
        .expect("version check");
    }
}

//! `autonoma.db`: the embedded SQLite store for durable cross-run memory,
//! the human-input queue, and searchable event/task history.
//!
//! A thin `rusqlite` wrapper owning its own schema migration
//! (`CREATE TABLE IF NOT EXISTS` + indexes run at open time) and exposing
//! narrow CRUD methods rather than a generic query interface. Unlike
//! `StateStore`'s `state.json` (the single authoritative resumption
//! record), `autonoma.db` is the system's queryable long-term memory: it's
//! additive-only and safe to rebuild from scratch without losing the
//! ability to resume a run.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::errors::StoreError;

/// A free-text memory note an agent chose to persist for future phases or
/// future runs.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub id: i64,
    pub role: String,
    pub tags: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A blocker awaiting a human operator's response.
#[derive(Debug, Clone)]
pub struct HumanQueueEntry {
    pub id: i64,
    pub phase: String,
    pub task_id: Option<String>,
    pub question: String,
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(working_dir: &std::path::Path) -> Result<Self, StoreError> {
        let dir = working_dir.join(".autonoma");
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let conn = Connection::open(dir.join("autonoma.db"))?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(SCHEMA)
            .map_err(|source| StoreError::Migration { version: 1, source })
    }

    // -- memories -----------------------------------------------------

    pub fn insert_memory(&self, role: &str, tags: &str, content: &str) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO memories (role, tags, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![role, tags, content, Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Full-text search over memory content via the `memories_fts` virtual
    /// table, most recent match first.
    pub fn search_memories(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.role, m.tags, m.content, m.created_at
             FROM memories_fts f
             JOIN memories m ON m.id = f.rowid
             WHERE memories_fts MATCH ?1
             ORDER BY m.id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![query, limit as i64], row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, role, tags, content, created_at FROM memories ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    // -- human queue ----------------------------------------------------

    pub fn enqueue_human_question(
        &self,
        phase: &str,
        task_id: Option<&str>,
        question: &str,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO human_queue (phase, task_id, question, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![phase, task_id, question, Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn answer_human_question(&self, id: i64, answer: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE human_queue SET answer = ?1, answered_at = ?2 WHERE id = ?3",
            params![answer, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn pending_human_questions(&self) -> Result<Vec<HumanQueueEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, phase, task_id, question, answer, created_at, answered_at
             FROM human_queue WHERE answer IS NULL ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_human_queue_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    // -- events ---------------------------------------------------------

    /// Appends a structured audit event, e.g. `("phase_transition",
    /// {"from":"planning","to":"task-breakdown"})`.
    pub fn record_event(&self, kind: &str, payload: &serde_json::Value) -> Result<(), StoreError> {
        let payload_text = serde_json::to_string(payload)?;
        self.conn.execute(
            "INSERT INTO events (kind, payload, created_at) VALUES (?1, ?2, ?3)",
            params![kind, payload_text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let created_at_text: String = row.get(4)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        role: row.get(1)?,
        tags: row.get(2)?,
        content: row.get(3)?,
        created_at: parse_timestamp(&created_at_text),
    })
}

fn row_to_human_queue_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<HumanQueueEntry> {
    let created_at_text: String = row.get(5)?;
    let answered_at_text: Option<String> = row.get(6)?;
    Ok(HumanQueueEntry {
        id: row.get(0)?,
        phase: row.get(1)?,
        task_id: row.get(2)?,
        question: row.get(3)?,
        answer: row.get(4)?,
        created_at: parse_timestamp(&created_at_text),
        answered_at: answered_at_text.as_deref().map(parse_timestamp),
    })
}

fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    requirements_path TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE TABLE IF NOT EXISTS phases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE TABLE IF NOT EXISTS milestones (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batches (
    batch_id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    parallel INTEGER NOT NULL,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    batch_id TEXT NOT NULL REFERENCES batches(batch_id),
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    assigned_to TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tasks_batch_id ON tasks(batch_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE VIRTUAL TABLE IF NOT EXISTS tasks_fts USING fts5(
    title, description, content='tasks', content_rowid='rowid'
);
CREATE TRIGGER IF NOT EXISTS tasks_ai AFTER INSERT ON tasks BEGIN
    INSERT INTO tasks_fts(rowid, title, description) VALUES (new.rowid, new.title, new.description);
END;
CREATE TRIGGER IF NOT EXISTS tasks_ad AFTER DELETE ON tasks BEGIN
    INSERT INTO tasks_fts(tasks_fts, rowid, title, description) VALUES ('delete', old.rowid, old.title, old.description);
END;
CREATE TRIGGER IF NOT EXISTS tasks_au AFTER UPDATE ON tasks BEGIN
    INSERT INTO tasks_fts(tasks_fts, rowid, title, description) VALUES ('delete', old.rowid, old.title, old.description);
    INSERT INTO tasks_fts(rowid, title, description) VALUES (new.rowid, new.title, new.description);
END;

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    role TEXT NOT NULL,
    display_name TEXT NOT NULL,
    status TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0.0
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    phase TEXT NOT NULL,
    state_snapshot TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);

CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content, content='memories', content_rowid='id'
);
CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content) VALUES (new.id, new.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content) VALUES ('delete', old.id, old.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content) VALUES ('delete', old.id, old.content);
    INSERT INTO memories_fts(rowid, content) VALUES (new.id, new.content);
END;

CREATE TABLE IF NOT EXISTS human_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    phase TEXT NOT NULL,
    task_id TEXT,
    question TEXT NOT NULL,
    answer TEXT,
    created_at TEXT NOT NULL,
    answered_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_human_queue_unanswered ON human_queue(answer) WHERE answer IS NULL;

CREATE TABLE IF NOT EXISTS retry_contexts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    reason TEXT NOT NULL,
    verification_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_retry_contexts_task_id ON retry_contexts(task_id);
"#;

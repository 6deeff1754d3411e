//! Durable event buffer.
//!
//! An ordered, persistent FIFO of pending records backed by SQLite. Entries
//! survive process restarts and are removed only after the server has
//! acknowledged them, or once their attempt counter reaches the poison
//! threshold. Insertion order (the autoincrement `id`) is send order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, params_from_iter, Connection};
use snafu::{ResultExt, Snafu};
use tracing::warn;

use crate::event::{FimRecord, LogRecord};

/// Discriminator stored next to each serialized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Log,
    Fim,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Log => "log",
            EventKind::Fim => "fim",
        }
    }

    fn from_db(kind: &str) -> Option<Self> {
        match kind {
            "log" => Some(EventKind::Log),
            "fim" => Some(EventKind::Fim),
            _ => None,
        }
    }
}

/// One pending entry as handed to the shipper.
#[derive(Debug, Clone)]
pub struct BufferedEntry {
    pub id: i64,
    pub kind: EventKind,
    pub payload: String,
}

#[derive(Debug, Snafu)]
pub enum BufferError {
    #[snafu(display("failed to create buffer directory {}: {}", path.display(), source))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to open event buffer at {}: {}", path.display(), source))]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("event buffer storage error: {}", source))]
    Storage { source: rusqlite::Error },

    #[snafu(display("failed to serialize record: {}", source))]
    Encode { source: serde_json::Error },
}

/// Persistent FIFO of pending records with per-entry attempt counters.
///
/// All operations run inside a single transaction on one connection; the
/// mutex serializes callers from the collector threads and the shipper
/// worker.
pub struct EventBuffer {
    conn: Mutex<Connection>,
}

impl EventBuffer {
    /// Open (creating if necessary) the buffer database at `path`.
    pub fn open(path: &Path) -> Result<Self, BufferError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(CreateDirSnafu { path: parent })?;
        }
        let conn = Connection::open(path).context(OpenSnafu { path })?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context(OpenSnafu { path })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 kind TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 attempts INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);",
        )
        .context(OpenSnafu { path })?;
        Ok(EventBuffer {
            conn: Mutex::new(conn),
        })
    }

    /// Append a log record. Returns the assigned entry id.
    pub fn enqueue_log(&self, record: &LogRecord) -> Result<i64, BufferError> {
        let payload = serde_json::to_string(record).context(EncodeSnafu)?;
        self.enqueue(EventKind::Log, &payload)
    }

    /// Append a FIM record. Returns the assigned entry id.
    pub fn enqueue_fim(&self, record: &FimRecord) -> Result<i64, BufferError> {
        let payload = serde_json::to_string(record).context(EncodeSnafu)?;
        self.enqueue(EventKind::Fim, &payload)
    }

    fn enqueue(&self, kind: EventKind, payload: &str) -> Result<i64, BufferError> {
        let mut conn = self.conn.lock().expect("buffer lock poisoned");
        let tx = conn.transaction().context(StorageSnafu)?;
        tx.execute(
            "INSERT INTO events (kind, payload, created_at) VALUES (?1, ?2, ?3)",
            params![kind.as_str(), payload, chrono::Utc::now().to_rfc3339()],
        )
        .context(StorageSnafu)?;
        let id = tx.last_insert_rowid();
        tx.commit().context(StorageSnafu)?;
        Ok(id)
    }

    /// Return up to `limit` of the oldest entries in insertion order.
    /// Non-destructive; entries stay pending until [`EventBuffer::remove`].
    pub fn next_batch(&self, limit: usize) -> Result<Vec<BufferedEntry>, BufferError> {
        let conn = self.conn.lock().expect("buffer lock poisoned");
        let mut stmt = conn
            .prepare("SELECT id, kind, payload FROM events ORDER BY id ASC LIMIT ?1")
            .context(StorageSnafu)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context(StorageSnafu)?;

        let mut batch = Vec::new();
        for row in rows {
            let (id, kind, payload) = row.context(StorageSnafu)?;
            match EventKind::from_db(&kind) {
                Some(kind) => batch.push(BufferedEntry { id, kind, payload }),
                None => warn!(message = "Skipping buffered entry of unknown kind.", %id, %kind),
            }
        }
        Ok(batch)
    }

    /// Delete acknowledged entries. An empty list is a no-op.
    pub fn remove(&self, ids: &[i64]) -> Result<(), BufferError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("buffer lock poisoned");
        let tx = conn.transaction().context(StorageSnafu)?;
        let placeholders = vec!["?"; ids.len()].join(",");
        tx.execute(
            &format!("DELETE FROM events WHERE id IN ({placeholders})"),
            params_from_iter(ids.iter()),
        )
        .context(StorageSnafu)?;
        tx.commit().context(StorageSnafu)?;
        Ok(())
    }

    /// Atomically increment the attempt counter of each listed entry.
    pub fn bump_attempts(&self, ids: &[i64]) -> Result<(), BufferError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("buffer lock poisoned");
        let tx = conn.transaction().context(StorageSnafu)?;
        let placeholders = vec!["?"; ids.len()].join(",");
        tx.execute(
            &format!("UPDATE events SET attempts = attempts + 1 WHERE id IN ({placeholders})"),
            params_from_iter(ids.iter()),
        )
        .context(StorageSnafu)?;
        tx.commit().context(StorageSnafu)?;
        Ok(())
    }

    /// Delete entries whose attempt counter has reached `max_attempts`.
    /// Returns how many were evicted.
    pub fn evict_poison(&self, max_attempts: u32) -> Result<usize, BufferError> {
        let mut conn = self.conn.lock().expect("buffer lock poisoned");
        let tx = conn.transaction().context(StorageSnafu)?;
        let evicted = tx
            .execute(
                "DELETE FROM events WHERE attempts >= ?1",
                params![max_attempts],
            )
            .context(StorageSnafu)?;
        tx.commit().context(StorageSnafu)?;
        Ok(evicted)
    }

    /// Exact count of pending entries.
    pub fn count(&self) -> Result<u64, BufferError> {
        let conn = self.conn.lock().expect("buffer lock poisoned");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .context(StorageSnafu)?;
        Ok(count as u64)
    }

    /// Drop every pending entry. Administrative use only.
    pub fn clear(&self) -> Result<(), BufferError> {
        let mut conn = self.conn.lock().expect("buffer lock poisoned");
        let tx = conn.transaction().context(StorageSnafu)?;
        tx.execute("DELETE FROM events", []).context(StorageSnafu)?;
        tx.commit().context(StorageSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::event::LogRecord;

    fn log_record(message: &str) -> LogRecord {
        LogRecord::tailed(
            "2024-01-15T10:30:00Z".into(),
            "testhost",
            "/var/log/app.log",
            message.into(),
            Map::new(),
        )
    }

    fn fim_record() -> FimRecord {
        FimRecord {
            timestamp: "2024-01-15T10:30:00Z".into(),
            hostname: "testhost".into(),
            source: crate::AGENT_SOURCE.into(),
            source_type: "fim".into(),
            event_type: crate::event::FimEventKind::Created,
            file_path: "/etc/test.conf".into(),
            previous_hash: None,
            current_hash: Some("sha256:abc123".into()),
            file_owner: Some("0".into()),
            file_permissions: Some("644".into()),
            metadata: Map::new(),
        }
    }

    fn open_temp() -> (tempfile::TempDir, EventBuffer) {
        let dir = tempfile::tempdir().unwrap();
        let buffer = EventBuffer::open(&dir.path().join("buffer.db")).unwrap();
        (dir, buffer)
    }

    #[test]
    fn enqueue_and_count() {
        let (_dir, buffer) = open_temp();
        assert_eq!(buffer.count().unwrap(), 0);

        let id = buffer.enqueue_log(&log_record("Test message")).unwrap();
        assert!(id > 0);
        assert_eq!(buffer.count().unwrap(), 1);

        buffer.enqueue_fim(&fim_record()).unwrap();
        assert_eq!(buffer.count().unwrap(), 2);
    }

    #[test]
    fn batch_preserves_insertion_order_across_kinds() {
        let (_dir, buffer) = open_temp();
        buffer.enqueue_log(&log_record("first")).unwrap();
        buffer.enqueue_fim(&fim_record()).unwrap();
        buffer.enqueue_log(&log_record("third")).unwrap();

        let batch = buffer.next_batch(10).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].kind, EventKind::Log);
        assert_eq!(batch[1].kind, EventKind::Fim);
        assert_eq!(batch[2].kind, EventKind::Log);
        assert!(batch[0].id < batch[1].id && batch[1].id < batch[2].id);
    }

    #[test]
    fn batch_respects_limit_and_is_non_destructive() {
        let (_dir, buffer) = open_temp();
        for i in 0..10 {
            buffer.enqueue_log(&log_record(&format!("Message {i}"))).unwrap();
        }

        let batch = buffer.next_batch(5).unwrap();
        assert_eq!(batch.len(), 5);
        let first: LogRecord = serde_json::from_str(&batch[0].payload).unwrap();
        let last: LogRecord = serde_json::from_str(&batch[4].payload).unwrap();
        assert_eq!(first.message, "Message 0");
        assert_eq!(last.message, "Message 4");
        assert_eq!(buffer.count().unwrap(), 10);
    }

    #[test]
    fn remove_deletes_only_listed_entries() {
        let (_dir, buffer) = open_temp();
        let ids: Vec<i64> = (0..5)
            .map(|i| buffer.enqueue_log(&log_record(&format!("Message {i}"))).unwrap())
            .collect();

        buffer.remove(&ids[..3]).unwrap();
        assert_eq!(buffer.count().unwrap(), 2);

        let batch = buffer.next_batch(10).unwrap();
        let first: LogRecord = serde_json::from_str(&batch[0].payload).unwrap();
        assert_eq!(first.message, "Message 3");
    }

    #[test]
    fn remove_empty_list_is_a_noop() {
        let (_dir, buffer) = open_temp();
        buffer.remove(&[]).unwrap();
    }

    #[test]
    fn poison_eviction_fires_exactly_at_threshold() {
        let (_dir, buffer) = open_temp();
        let id = buffer.enqueue_log(&log_record("stuck")).unwrap();

        for _ in 0..9 {
            buffer.bump_attempts(&[id]).unwrap();
        }
        assert_eq!(buffer.evict_poison(10).unwrap(), 0);
        assert_eq!(buffer.count().unwrap(), 1);

        buffer.bump_attempts(&[id]).unwrap();
        assert_eq!(buffer.evict_poison(10).unwrap(), 1);
        assert_eq!(buffer.count().unwrap(), 0);
    }

    #[test]
    fn clear_removes_everything() {
        let (_dir, buffer) = open_temp();
        for i in 0..5 {
            buffer.enqueue_log(&log_record(&format!("Message {i}"))).unwrap();
        }
        buffer.clear().unwrap();
        assert_eq!(buffer.count().unwrap(), 0);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");

        {
            let buffer = EventBuffer::open(&path).unwrap();
            for i in 0..3 {
                buffer.enqueue_log(&log_record(&format!("Persistent {i}"))).unwrap();
            }
        }

        let buffer = EventBuffer::open(&path).unwrap();
        assert_eq!(buffer.count().unwrap(), 3);
        let batch = buffer.next_batch(10).unwrap();
        let messages: Vec<String> = batch
            .iter()
            .map(|entry| serde_json::from_str::<LogRecord>(&entry.payload).unwrap().message)
            .collect();
        assert_eq!(messages, vec!["Persistent 0", "Persistent 1", "Persistent 2"]);
    }
}

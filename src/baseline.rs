//! FIM baseline store: the known-good `(hash, metadata)` per watched path.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use snafu::{ensure, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum BaselineError {
    #[snafu(display("failed to create baseline directory {}: {}", path.display(), source))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to open baseline store at {}: {}", path.display(), source))]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("baseline storage error: {}", source))]
    Storage { source: rusqlite::Error },

    #[snafu(display("refusing to store empty hash for {}", path.display()))]
    EmptyHash { path: PathBuf },

    #[snafu(display("failed to serialize baseline metadata: {}", source))]
    Encode { source: serde_json::Error },
}

/// Keyed store of `path -> (hash, metadata)`, exactly one row per path.
///
/// A hash is never stored empty; when a file's hash is unknown, its entry
/// simply does not exist.
pub struct BaselineStore {
    conn: Mutex<Connection>,
}

impl BaselineStore {
    /// Open (creating if necessary) the baseline database at `path`.
    pub fn open(path: &Path) -> Result<Self, BaselineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context(CreateDirSnafu { path: parent })?;
        }
        let conn = Connection::open(path).context(OpenSnafu { path })?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context(OpenSnafu { path })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS baselines (
                 file_path TEXT PRIMARY KEY,
                 hash TEXT NOT NULL,
                 metadata TEXT,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .context(OpenSnafu { path })?;
        Ok(BaselineStore {
            conn: Mutex::new(conn),
        })
    }

    /// Fetch the stored hash and metadata for `path`, if any.
    pub fn get(
        &self,
        path: &Path,
    ) -> Result<Option<(String, serde_json::Map<String, serde_json::Value>)>, BaselineError> {
        let conn = self.conn.lock().expect("baseline lock poisoned");
        let row = conn
            .query_row(
                "SELECT hash, metadata FROM baselines WHERE file_path = ?1",
                params![path.to_string_lossy()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()
            .context(StorageSnafu)?;

        Ok(row.map(|(hash, metadata)| {
            let metadata = metadata
                .as_deref()
                .and_then(|text| serde_json::from_str(text).ok())
                .unwrap_or_default();
            (hash, metadata)
        }))
    }

    /// Insert or update the baseline for `path`, refreshing `updated_at`.
    pub fn set(
        &self,
        path: &Path,
        hash: &str,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), BaselineError> {
        ensure!(!hash.is_empty(), EmptyHashSnafu { path });
        let encoded = serde_json::to_string(metadata).context(EncodeSnafu)?;
        let now = chrono::Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().expect("baseline lock poisoned");
        let tx = conn.transaction().context(StorageSnafu)?;
        tx.execute(
            "INSERT INTO baselines (file_path, hash, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(file_path) DO UPDATE SET
                 hash = excluded.hash,
                 metadata = excluded.metadata,
                 updated_at = excluded.updated_at",
            params![path.to_string_lossy(), hash, encoded, now],
        )
        .context(StorageSnafu)?;
        tx.commit().context(StorageSnafu)?;
        Ok(())
    }

    /// Drop the baseline for `path`. Removing an absent path is a no-op.
    pub fn remove(&self, path: &Path) -> Result<(), BaselineError> {
        let mut conn = self.conn.lock().expect("baseline lock poisoned");
        let tx = conn.transaction().context(StorageSnafu)?;
        tx.execute(
            "DELETE FROM baselines WHERE file_path = ?1",
            params![path.to_string_lossy()],
        )
        .context(StorageSnafu)?;
        tx.commit().context(StorageSnafu)?;
        Ok(())
    }

    /// Every stored baseline, for the full verification scan.
    #[allow(clippy::type_complexity)]
    pub fn all(
        &self,
    ) -> Result<Vec<(PathBuf, String, serde_json::Map<String, serde_json::Value>)>, BaselineError>
    {
        let conn = self.conn.lock().expect("baseline lock poisoned");
        let mut stmt = conn
            .prepare("SELECT file_path, hash, metadata FROM baselines ORDER BY file_path")
            .context(StorageSnafu)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .context(StorageSnafu)?;

        let mut baselines = Vec::new();
        for row in rows {
            let (path, hash, metadata) = row.context(StorageSnafu)?;
            let metadata = metadata
                .as_deref()
                .and_then(|text| serde_json::from_str(text).ok())
                .unwrap_or_default();
            baselines.push((PathBuf::from(path), hash, metadata));
        }
        Ok(baselines)
    }

    /// Number of stored baselines.
    pub fn count(&self) -> Result<u64, BaselineError> {
        let conn = self.conn.lock().expect("baseline lock poisoned");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM baselines", [], |row| row.get(0))
            .context(StorageSnafu)?;
        Ok(count as u64)
    }

    /// Drop every baseline. Administrative use only.
    pub fn clear(&self) -> Result<(), BaselineError> {
        let mut conn = self.conn.lock().expect("baseline lock poisoned");
        let tx = conn.transaction().context(StorageSnafu)?;
        tx.execute("DELETE FROM baselines", [])
            .context(StorageSnafu)?;
        tx.commit().context(StorageSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn open_temp() -> (tempfile::TempDir, BaselineStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(&dir.path().join("baseline.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_dir, store) = open_temp();
        let mut metadata = serde_json::Map::new();
        metadata.insert("size".into(), json!(42));

        store
            .set(Path::new("/etc/test.conf"), "sha256:abc123", &metadata)
            .unwrap();

        let (hash, meta) = store.get(Path::new("/etc/test.conf")).unwrap().unwrap();
        assert_eq!(hash, "sha256:abc123");
        assert_eq!(meta["size"], json!(42));
    }

    #[test]
    fn get_missing_path_is_none() {
        let (_dir, store) = open_temp();
        assert!(store.get(Path::new("/nope")).unwrap().is_none());
    }

    #[test]
    fn set_upserts_by_path() {
        let (_dir, store) = open_temp();
        let metadata = serde_json::Map::new();
        store
            .set(Path::new("/etc/test.conf"), "sha256:old", &metadata)
            .unwrap();
        store
            .set(Path::new("/etc/test.conf"), "sha256:new", &metadata)
            .unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let (hash, _) = store.get(Path::new("/etc/test.conf")).unwrap().unwrap();
        assert_eq!(hash, "sha256:new");
    }

    #[test]
    fn empty_hash_is_rejected() {
        let (_dir, store) = open_temp();
        let err = store
            .set(Path::new("/etc/test.conf"), "", &serde_json::Map::new())
            .unwrap_err();
        assert!(matches!(err, BaselineError::EmptyHash { .. }));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn remove_deletes_the_entry() {
        let (_dir, store) = open_temp();
        store
            .set(Path::new("/etc/test.conf"), "sha256:abc", &serde_json::Map::new())
            .unwrap();
        store.remove(Path::new("/etc/test.conf")).unwrap();
        assert!(store.get(Path::new("/etc/test.conf")).unwrap().is_none());

        // removing again is fine
        store.remove(Path::new("/etc/test.conf")).unwrap();
    }

    #[test]
    fn all_returns_every_entry() {
        let (_dir, store) = open_temp();
        for name in ["a.conf", "b.conf", "c.conf"] {
            store
                .set(
                    &PathBuf::from("/etc").join(name),
                    "sha256:abc",
                    &serde_json::Map::new(),
                )
                .unwrap();
        }
        let all = store.all().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|(_, hash, _)| hash == "sha256:abc"));
    }

    #[test]
    fn baselines_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.db");
        {
            let store = BaselineStore::open(&path).unwrap();
            store
                .set(Path::new("/etc/test.conf"), "sha256:abc", &serde_json::Map::new())
                .unwrap();
        }
        let store = BaselineStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }
}

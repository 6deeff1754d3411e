//! Record types shared by the tailer, the integrity monitor, and the shipper.
//!
//! A record is born in a collector, serialized into the durable buffer, and
//! reconstructed by the shipper into the wire shape the server ingests:
//! `{"type": "log" | "fim", ...record fields}`.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::AGENT_SOURCE;

/// One text line read from a watched file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub hostname: String,
    pub source: String,
    pub source_type: String,
    pub file_path: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl LogRecord {
    /// Build a record for a line tailed out of `file_path`.
    ///
    /// `timestamp` is passed in rather than taken here so that all lines of
    /// one drain pass share a single instant.
    pub fn tailed(
        timestamp: String,
        hostname: &str,
        file_path: &str,
        message: String,
        metadata: Map<String, Value>,
    ) -> Self {
        LogRecord {
            timestamp,
            hostname: hostname.to_owned(),
            source: AGENT_SOURCE.to_owned(),
            source_type: "file".to_owned(),
            file_path: file_path.to_owned(),
            message,
            metadata,
        }
    }
}

/// The kind of change a FIM record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FimEventKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for FimEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FimEventKind::Created => f.write_str("created"),
            FimEventKind::Modified => f.write_str("modified"),
            FimEventKind::Deleted => f.write_str("deleted"),
        }
    }
}

/// A file integrity change with before/after content hashes.
///
/// `previous_hash` is absent for `created`, `current_hash` for `deleted`.
/// Records produced by a periodic rescan rather than a live filesystem event
/// carry `"verification": true` in their metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FimRecord {
    pub timestamp: String,
    pub hostname: String,
    pub source: String,
    pub source_type: String,
    pub event_type: FimEventKind,
    pub file_path: String,
    pub previous_hash: Option<String>,
    pub current_hash: Option<String>,
    pub file_owner: Option<String>,
    pub file_permissions: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// The tagged sum of everything the agent ships.
///
/// Serializes internally tagged, which is exactly the wire shape of one
/// element of the `events` array in an ingest batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Log(LogRecord),
    Fim(FimRecord),
}

/// Current UTC instant as ISO-8601 with a `Z` suffix, the timestamp format
/// of every record the agent emits.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

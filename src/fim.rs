//! File integrity monitoring.
//!
//! On first start the monitor hashes every matching file under the enabled
//! roots into the baseline store without emitting anything. From then on,
//! filesystem events produce `created`/`modified`/`deleted` records with
//! before/after hashes, and `verify_baseline` re-checks the whole store on
//! demand, tagging its findings with `verification: true`.
//!
//! A modify event whose content hashes to the stored baseline is suppressed:
//! editors routinely rewrite files without changing a byte.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use glob::Pattern;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::baseline::BaselineStore;
use crate::config::WatchPath;
use crate::event::{now_timestamp, FimEventKind, FimRecord};
use crate::hash::hash_file;
use crate::sink::EventSink;
use crate::AGENT_SOURCE;

const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Native stat fields captured into record metadata at emission time.
fn file_metadata(path: &Path) -> Map<String, Value> {
    let mut metadata = Map::new();
    let Ok(stat) = fs::metadata(path) else {
        return metadata;
    };
    metadata.insert("size".into(), json!(stat.len()));
    if let Ok(modified) = stat.modified() {
        let mtime = chrono::DateTime::<chrono::Utc>::from(modified);
        metadata.insert("mtime".into(), json!(mtime.to_rfc3339()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        metadata.insert("mode".into(), json!(format!("{:o}", stat.mode())));
        metadata.insert("uid".into(), json!(stat.uid()));
        metadata.insert("gid".into(), json!(stat.gid()));
        if let Some(ctime) =
            chrono::DateTime::from_timestamp(stat.ctime(), stat.ctime_nsec() as u32)
        {
            metadata.insert("ctime".into(), json!(ctime.to_rfc3339()));
        }
    }
    metadata
}

fn owner_and_permissions(metadata: &Map<String, Value>) -> (Option<String>, Option<String>) {
    let owner = metadata.get("uid").map(|uid| match uid {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    });
    let permissions = metadata
        .get("mode")
        .and_then(Value::as_str)
        .map(str::to_owned);
    (owner, permissions)
}

/// Assemble a FIM record for `path`. Stat metadata is captured live when the
/// file still exists, otherwise `fallback` (the stored baseline metadata)
/// supplies owner and permissions.
fn build_record(
    hostname: &str,
    event_type: FimEventKind,
    path: &Path,
    previous_hash: Option<String>,
    current_hash: Option<String>,
    fallback: &Map<String, Value>,
    extra: Map<String, Value>,
) -> FimRecord {
    let stat = file_metadata(path);
    let mut metadata = if stat.is_empty() { fallback.clone() } else { stat };
    let (file_owner, file_permissions) = owner_and_permissions(&metadata);
    for (key, value) in extra {
        metadata.insert(key, value);
    }
    FimRecord {
        timestamp: now_timestamp(),
        hostname: hostname.to_owned(),
        source: AGENT_SOURCE.to_owned(),
        source_type: "fim".to_owned(),
        event_type,
        file_path: path.to_string_lossy().into_owned(),
        previous_hash,
        current_hash,
        file_owner,
        file_permissions,
        metadata,
    }
}

/// Per-root event handler.
pub(crate) struct FimHandler {
    watch: WatchPath,
    pattern: Pattern,
    hostname: String,
    baseline: Arc<BaselineStore>,
    sink: EventSink,
}

impl FimHandler {
    pub(crate) fn new(
        watch: WatchPath,
        hostname: &str,
        baseline: Arc<BaselineStore>,
        sink: EventSink,
    ) -> Self {
        let pattern = Pattern::new(&watch.pattern).unwrap_or_else(|error| {
            warn!(
                message = "Invalid FIM pattern; no files will match.",
                pattern = %watch.pattern,
                %error,
            );
            Pattern::new("").expect("empty pattern is valid")
        });
        FimHandler {
            watch,
            pattern,
            hostname: hostname.to_owned(),
            baseline,
            sink,
        }
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.pattern.matches(&name.to_string_lossy()))
            .unwrap_or(false)
    }

    fn watch_metadata(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        extra.insert("fim_path".into(), json!(self.watch.path.to_string_lossy()));
        extra.insert("pattern".into(), json!(self.watch.pattern));
        extra
    }

    pub(crate) fn handle_event(&self, event: &notify::Event) {
        match &event.kind {
            EventKind::Create(CreateKind::Folder) => {}
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.on_created(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                self.on_moved(&event.paths[0], &event.paths[1]);
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    self.on_deleted(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    self.on_created(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in &event.paths {
                    if path.is_file() {
                        self.on_modified(path);
                    } else {
                        self.on_deleted(path);
                    }
                }
            }
            EventKind::Modify(_) | EventKind::Any => {
                for path in &event.paths {
                    self.on_modified(path);
                }
            }
            EventKind::Remove(RemoveKind::Folder) => {}
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.on_deleted(path);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn on_created(&self, path: &Path) {
        if !self.matches(path) || !path.is_file() {
            return;
        }
        let current_hash = match hash_file(path) {
            Ok(hash) => hash,
            Err(error) => {
                warn!(message = "Failed to hash created file.", ?path, %error);
                return;
            }
        };
        let metadata = file_metadata(path);
        if let Err(error) = self.baseline.set(path, &current_hash, &metadata) {
            error!(message = "Failed to store baseline.", ?path, %error);
            return;
        }
        info!(message = "FIM file created.", ?path);
        self.sink.fim(build_record(
            &self.hostname,
            FimEventKind::Created,
            path,
            None,
            Some(current_hash),
            &Map::new(),
            self.watch_metadata(),
        ));
    }

    pub(crate) fn on_modified(&self, path: &Path) {
        if !self.matches(path) || !path.is_file() {
            return;
        }
        let previous_hash = match self.baseline.get(path) {
            Ok(entry) => entry.map(|(hash, _)| hash),
            Err(error) => {
                error!(message = "Failed to read baseline.", ?path, %error);
                return;
            }
        };
        let current_hash = match hash_file(path) {
            Ok(hash) => hash,
            Err(error) => {
                warn!(message = "Failed to hash modified file.", ?path, %error);
                return;
            }
        };
        // Quiet write: content unchanged, no record.
        if previous_hash.as_deref() == Some(current_hash.as_str()) {
            return;
        }
        let metadata = file_metadata(path);
        if let Err(error) = self.baseline.set(path, &current_hash, &metadata) {
            error!(message = "Failed to store baseline.", ?path, %error);
            return;
        }
        info!(message = "FIM file modified.", ?path);
        self.sink.fim(build_record(
            &self.hostname,
            FimEventKind::Modified,
            path,
            previous_hash,
            Some(current_hash),
            &Map::new(),
            self.watch_metadata(),
        ));
    }

    pub(crate) fn on_deleted(&self, path: &Path) {
        if !self.matches(path) {
            return;
        }
        let entry = match self.baseline.get(path) {
            Ok(entry) => entry,
            Err(error) => {
                error!(message = "Failed to read baseline.", ?path, %error);
                return;
            }
        };
        let (previous_hash, stored_metadata) = match entry {
            Some((hash, metadata)) => (Some(hash), metadata),
            None => (None, Map::new()),
        };
        if let Err(error) = self.baseline.remove(path) {
            error!(message = "Failed to remove baseline.", ?path, %error);
            return;
        }
        info!(message = "FIM file deleted.", ?path);
        self.sink.fim(build_record(
            &self.hostname,
            FimEventKind::Deleted,
            path,
            previous_hash,
            None,
            &stored_metadata,
            self.watch_metadata(),
        ));
    }

    /// A move is a delete of the source plus a create of the destination;
    /// no content hash is carried across.
    pub(crate) fn on_moved(&self, src: &Path, dst: &Path) {
        if self.matches(src) {
            let entry = self.baseline.get(src).unwrap_or_else(|error| {
                error!(message = "Failed to read baseline.", path = ?src, %error);
                None
            });
            if let Some((previous_hash, stored_metadata)) = entry {
                if let Err(error) = self.baseline.remove(src) {
                    error!(message = "Failed to remove baseline.", path = ?src, %error);
                } else {
                    self.sink.fim(build_record(
                        &self.hostname,
                        FimEventKind::Deleted,
                        src,
                        Some(previous_hash),
                        None,
                        &stored_metadata,
                        self.watch_metadata(),
                    ));
                }
            }
        }
        self.on_created(dst);
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    watchers: Vec<RecommendedWatcher>,
    threads: Vec<thread::JoinHandle<()>>,
}

/// The integrity monitor component: baseline construction, live events, and
/// the on-demand verification pass.
pub struct Fim {
    paths: Vec<WatchPath>,
    enabled: bool,
    hostname: String,
    baseline: Arc<BaselineStore>,
    sink: EventSink,
    state: Mutex<Option<Running>>,
}

impl Fim {
    pub fn new(
        paths: Vec<WatchPath>,
        enabled: bool,
        hostname: &str,
        baseline: Arc<BaselineStore>,
        sink: EventSink,
    ) -> Self {
        Fim {
            paths,
            enabled,
            hostname: hostname.to_owned(),
            baseline,
            sink,
            state: Mutex::new(None),
        }
    }

    /// Hash every matching file under the enabled roots into the baseline
    /// store. Emits no events. Returns the number of files baselined.
    pub fn build_baseline(&self) -> usize {
        let mut count = 0;
        for watch in self.paths.iter().filter(|watch| watch.enabled) {
            let glob_path = if watch.recursive {
                watch.path.join("**").join(&watch.pattern)
            } else {
                watch.path.join(&watch.pattern)
            };
            let Some(glob_str) = glob_path.to_str() else {
                warn!(message = "FIM path is not valid UTF-8; skipping.", path = ?watch.path);
                continue;
            };
            let entries = match glob::glob(glob_str) {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(message = "Failed to enumerate FIM path.", path = ?watch.path, %error);
                    continue;
                }
            };
            for path in entries.flatten() {
                if !path.is_file() {
                    continue;
                }
                let hash = match hash_file(&path) {
                    Ok(hash) => hash,
                    Err(error) => {
                        warn!(message = "Failed to hash file for baseline.", ?path, %error);
                        continue;
                    }
                };
                let metadata = file_metadata(&path);
                match self.baseline.set(&path, &hash, &metadata) {
                    Ok(()) => count += 1,
                    Err(error) => error!(message = "Failed to store baseline.", ?path, %error),
                }
            }
        }
        info!(message = "FIM baseline built.", files = count);
        count
    }

    /// Re-check every stored baseline against the filesystem, emitting
    /// `deleted` or `modified` records tagged `verification: true`.
    /// Returns the number of records emitted.
    pub fn verify_baseline(&self) -> usize {
        let baselines = match self.baseline.all() {
            Ok(baselines) => baselines,
            Err(error) => {
                error!(message = "Failed to enumerate baselines.", %error);
                return 0;
            }
        };

        let mut verification = Map::new();
        verification.insert("verification".into(), json!(true));

        let mut emitted = 0;
        for (path, stored_hash, stored_metadata) in baselines {
            if !path.exists() {
                if let Err(error) = self.baseline.remove(&path) {
                    error!(message = "Failed to remove baseline.", ?path, %error);
                    continue;
                }
                self.sink.fim(build_record(
                    &self.hostname,
                    FimEventKind::Deleted,
                    &path,
                    Some(stored_hash),
                    None,
                    &stored_metadata,
                    verification.clone(),
                ));
                emitted += 1;
                continue;
            }

            let current_hash = match hash_file(&path) {
                Ok(hash) => hash,
                Err(error) => {
                    warn!(message = "Failed to hash file during verification.", ?path, %error);
                    continue;
                }
            };
            if current_hash == stored_hash {
                continue;
            }

            let metadata = file_metadata(&path);
            if let Err(error) = self.baseline.set(&path, &current_hash, &metadata) {
                error!(message = "Failed to store baseline.", ?path, %error);
                continue;
            }
            self.sink.fim(build_record(
                &self.hostname,
                FimEventKind::Modified,
                &path,
                Some(stored_hash),
                Some(current_hash),
                &Map::new(),
                verification.clone(),
            ));
            emitted += 1;
        }

        if emitted > 0 {
            info!(message = "Baseline verification found changes.", records = emitted);
        }
        emitted
    }

    pub fn start(&self) {
        if !self.enabled {
            info!(message = "FIM is disabled in configuration.");
            return;
        }

        let mut state = self.state.lock().expect("fim state poisoned");
        if state.is_some() {
            return;
        }

        // First start: populate the baseline silently.
        match self.baseline.count() {
            Ok(0) => {
                self.build_baseline();
            }
            Ok(_) => {}
            Err(error) => error!(message = "Failed to inspect baseline store.", %error),
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut watchers = Vec::new();
        let mut threads = Vec::new();

        for watch in self.paths.iter().filter(|watch| watch.enabled) {
            if !watch.path.is_dir() {
                warn!(message = "FIM path does not exist.", path = ?watch.path);
                continue;
            }

            let handler = Arc::new(FimHandler::new(
                watch.clone(),
                &self.hostname,
                Arc::clone(&self.baseline),
                self.sink.clone(),
            ));

            let (tx, rx) = std::sync::mpsc::channel();
            let mut watcher = match notify::recommended_watcher(tx) {
                Ok(watcher) => watcher,
                Err(error) => {
                    warn!(message = "Failed to create filesystem watcher.", path = ?watch.path, %error);
                    continue;
                }
            };
            let mode = if watch.recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            if let Err(error) = watcher.watch(&watch.path, mode) {
                warn!(message = "Failed to watch FIM path.", path = ?watch.path, %error);
                continue;
            }

            info!(message = "FIM watching path.", path = ?watch.path, pattern = %watch.pattern);
            let stop_flag = Arc::clone(&stop);
            threads.push(thread::spawn(move || run_event_loop(rx, handler, stop_flag)));
            watchers.push(watcher);
        }

        *state = Some(Running {
            stop,
            watchers,
            threads,
        });
        info!(message = "File integrity monitor started.");
    }

    pub fn stop(&self) {
        let running = self.state.lock().expect("fim state poisoned").take();
        let Some(running) = running else {
            return;
        };
        running.stop.store(true, Ordering::SeqCst);
        drop(running.watchers);
        for thread in running.threads {
            if thread.join().is_err() {
                warn!(message = "FIM worker panicked.");
            }
        }
        info!(message = "File integrity monitor stopped.");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("fim state poisoned").is_some()
    }
}

fn run_event_loop(
    rx: Receiver<Result<notify::Event, notify::Error>>,
    handler: Arc<FimHandler>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(Ok(event)) => handler.handle_event(&event),
            Ok(Err(error)) => warn!(message = "Filesystem watch error.", %error),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::buffer::EventBuffer;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        buffer: Arc<EventBuffer>,
        baseline: Arc<BaselineStore>,
        sink: EventSink,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("monitored");
        fs::create_dir(&root).unwrap();
        let buffer = Arc::new(EventBuffer::open(&dir.path().join("buffer.db")).unwrap());
        let baseline = Arc::new(BaselineStore::open(&dir.path().join("baseline.db")).unwrap());
        let sink = EventSink::new(Arc::clone(&buffer), Arc::new(AtomicBool::new(false)));
        Fixture {
            _dir: dir,
            root,
            buffer,
            baseline,
            sink,
        }
    }

    fn watch(fixture: &Fixture, pattern: &str) -> WatchPath {
        WatchPath {
            path: fixture.root.clone(),
            pattern: pattern.to_owned(),
            recursive: false,
            enabled: true,
        }
    }

    fn handler(fixture: &Fixture, pattern: &str) -> FimHandler {
        FimHandler::new(
            watch(fixture, pattern),
            "testhost",
            Arc::clone(&fixture.baseline),
            fixture.sink.clone(),
        )
    }

    fn monitor(fixture: &Fixture, pattern: &str) -> Fim {
        Fim::new(
            vec![watch(fixture, pattern)],
            true,
            "testhost",
            Arc::clone(&fixture.baseline),
            fixture.sink.clone(),
        )
    }

    fn drain_records(buffer: &EventBuffer) -> Vec<FimRecord> {
        let batch = buffer.next_batch(100).unwrap();
        let ids: Vec<i64> = batch.iter().map(|entry| entry.id).collect();
        buffer.remove(&ids).unwrap();
        batch
            .iter()
            .map(|entry| serde_json::from_str::<FimRecord>(&entry.payload).unwrap())
            .collect()
    }

    #[test]
    fn baseline_construction_emits_no_events() {
        let fixture = fixture();
        fs::write(fixture.root.join("a.conf"), "A").unwrap();
        fs::write(fixture.root.join("b.conf"), "B").unwrap();
        fs::write(fixture.root.join("ignore.txt"), "x").unwrap();

        let monitor = monitor(&fixture, "*.conf");
        assert_eq!(monitor.build_baseline(), 2);
        assert_eq!(fixture.baseline.count().unwrap(), 2);
        assert_eq!(fixture.buffer.count().unwrap(), 0);
    }

    #[test]
    fn created_file_is_baselined_and_reported() {
        let fixture = fixture();
        let path = fixture.root.join("x.conf");
        fs::write(&path, "A").unwrap();

        let handler = handler(&fixture, "*.conf");
        handler.on_created(&path);

        let records = drain_records(&fixture.buffer);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.event_type, FimEventKind::Created);
        assert!(record.previous_hash.is_none());
        assert_eq!(
            record.current_hash.as_deref(),
            Some(hash_file(&path).unwrap().as_str())
        );
        assert_eq!(record.source_type, "fim");
        assert_eq!(record.metadata["pattern"], "*.conf");
        assert!(fixture.baseline.get(&path).unwrap().is_some());
    }

    #[test]
    fn quiet_write_is_suppressed() {
        let fixture = fixture();
        let path = fixture.root.join("x.conf");
        fs::write(&path, "A").unwrap();

        let handler = handler(&fixture, "*.conf");
        handler.on_created(&path);
        drain_records(&fixture.buffer);

        // Same content written again: no record.
        fs::write(&path, "A").unwrap();
        handler.on_modified(&path);
        assert_eq!(fixture.buffer.count().unwrap(), 0);
    }

    #[test]
    fn content_change_reports_both_hashes() {
        let fixture = fixture();
        let path = fixture.root.join("x.conf");
        fs::write(&path, "A").unwrap();

        let handler = handler(&fixture, "*.conf");
        handler.on_created(&path);
        drain_records(&fixture.buffer);
        let hash_a = hash_file(&path).unwrap();

        fs::write(&path, "B").unwrap();
        let hash_b = hash_file(&path).unwrap();
        handler.on_modified(&path);

        let records = drain_records(&fixture.buffer);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.event_type, FimEventKind::Modified);
        assert_eq!(record.previous_hash.as_deref(), Some(hash_a.as_str()));
        assert_eq!(record.current_hash.as_deref(), Some(hash_b.as_str()));
    }

    #[test]
    fn deletion_reports_previous_hash_only() {
        let fixture = fixture();
        let path = fixture.root.join("x.conf");
        fs::write(&path, "A").unwrap();
        let hash_a = hash_file(&path).unwrap();

        let handler = handler(&fixture, "*.conf");
        handler.on_created(&path);
        drain_records(&fixture.buffer);

        fs::remove_file(&path).unwrap();
        handler.on_deleted(&path);

        let records = drain_records(&fixture.buffer);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.event_type, FimEventKind::Deleted);
        assert_eq!(record.previous_hash.as_deref(), Some(hash_a.as_str()));
        assert!(record.current_hash.is_none());
        assert!(fixture.baseline.get(&path).unwrap().is_none());
    }

    #[test]
    fn move_reports_delete_then_create() {
        let fixture = fixture();
        let src = fixture.root.join("a.conf");
        let dst = fixture.root.join("b.conf");
        fs::write(&src, "A").unwrap();

        let handler = handler(&fixture, "*.conf");
        handler.on_created(&src);
        drain_records(&fixture.buffer);

        fs::rename(&src, &dst).unwrap();
        handler.on_moved(&src, &dst);

        let records = drain_records(&fixture.buffer);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, FimEventKind::Deleted);
        assert_eq!(records[0].file_path, src.to_string_lossy());
        assert_eq!(records[1].event_type, FimEventKind::Created);
        assert_eq!(records[1].file_path, dst.to_string_lossy());
        assert!(fixture.baseline.get(&src).unwrap().is_none());
        assert!(fixture.baseline.get(&dst).unwrap().is_some());
    }

    #[test]
    fn non_matching_files_are_ignored() {
        let fixture = fixture();
        let path = fixture.root.join("notes.txt");
        fs::write(&path, "A").unwrap();

        let handler = handler(&fixture, "*.conf");
        handler.on_created(&path);
        handler.on_modified(&path);
        handler.on_deleted(&path);
        assert_eq!(fixture.buffer.count().unwrap(), 0);
    }

    #[test]
    fn verification_reports_modified_files() {
        let fixture = fixture();
        let path = fixture.root.join("x.conf");
        fs::write(&path, "A").unwrap();
        let hash_a = hash_file(&path).unwrap();

        let monitor = monitor(&fixture, "*.conf");
        monitor.build_baseline();

        // Change behind the monitor's back, then verify.
        fs::write(&path, "B").unwrap();
        assert_eq!(monitor.verify_baseline(), 1);

        let records = drain_records(&fixture.buffer);
        let record = &records[0];
        assert_eq!(record.event_type, FimEventKind::Modified);
        assert_eq!(record.previous_hash.as_deref(), Some(hash_a.as_str()));
        assert_eq!(record.metadata["verification"], true);

        // Verification updated the baseline, so a second pass is clean.
        assert_eq!(monitor.verify_baseline(), 0);
    }

    #[test]
    fn verification_reports_deleted_files() {
        let fixture = fixture();
        let path = fixture.root.join("x.conf");
        fs::write(&path, "A").unwrap();

        let monitor = monitor(&fixture, "*.conf");
        monitor.build_baseline();
        fs::remove_file(&path).unwrap();

        assert_eq!(monitor.verify_baseline(), 1);
        let records = drain_records(&fixture.buffer);
        assert_eq!(records[0].event_type, FimEventKind::Deleted);
        assert_eq!(records[0].metadata["verification"], true);
        assert!(fixture.baseline.get(&path).unwrap().is_none());
    }

    #[test]
    fn verification_is_quiet_when_nothing_changed() {
        let fixture = fixture();
        fs::write(fixture.root.join("x.conf"), "A").unwrap();

        let monitor = monitor(&fixture, "*.conf");
        monitor.build_baseline();
        assert_eq!(monitor.verify_baseline(), 0);
        assert_eq!(fixture.buffer.count().unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn records_capture_owner_and_permissions() {
        let fixture = fixture();
        let path = fixture.root.join("x.conf");
        fs::write(&path, "A").unwrap();

        let handler = handler(&fixture, "*.conf");
        handler.on_created(&path);

        let records = drain_records(&fixture.buffer);
        let record = &records[0];
        assert!(record.file_owner.is_some());
        let permissions = record.file_permissions.as_deref().unwrap();
        assert!(permissions.chars().all(|c| c.is_digit(8)));
        assert!(record.metadata.contains_key("size"));
        assert!(record.metadata.contains_key("mtime"));
    }

    #[test]
    fn disabled_monitor_does_not_start() {
        let fixture = fixture();
        let monitor = Fim::new(
            vec![watch(&fixture, "*.conf")],
            false,
            "testhost",
            Arc::clone(&fixture.baseline),
            fixture.sink.clone(),
        );
        monitor.start();
        assert!(!monitor.is_running());
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let fixture = fixture();
        let monitor = monitor(&fixture, "*.conf");
        monitor.start();
        monitor.start();
        assert!(monitor.is_running());
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }
}

//! Offset-tracked line tailer driven by filesystem notifications.
//!
//! For every enabled watch root the tailer discovers files whose basename
//! matches the configured shell glob, remembers how far into each file it
//! has read, and emits one log record per newly appended line. Offsets live
//! only in memory: on start each file is initialized at its current end, so
//! pre-existing content is never replayed.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use glob::Pattern;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::WatchPath;
use crate::event::{now_timestamp, LogRecord};
use crate::sink::EventSink;

/// How long worker threads wait on the event channel before re-checking the
/// stop flag.
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Per-root state: the compiled pattern and the offset table.
pub(crate) struct WatchHandler {
    watch: WatchPath,
    pattern: Pattern,
    hostname: String,
    sink: EventSink,
    offsets: Mutex<HashMap<PathBuf, u64>>,
}

impl WatchHandler {
    pub(crate) fn new(watch: WatchPath, hostname: &str, sink: EventSink) -> Self {
        let pattern = Pattern::new(&watch.pattern).unwrap_or_else(|error| {
            warn!(
                message = "Invalid watch pattern; no files will match.",
                pattern = %watch.pattern,
                %error,
            );
            Pattern::new("").expect("empty pattern is valid")
        });
        WatchHandler {
            watch,
            pattern,
            hostname: hostname.to_owned(),
            sink,
            offsets: Mutex::new(HashMap::new()),
        }
    }

    /// Case-sensitive glob over the basename only; path components do not
    /// participate.
    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.pattern.matches(&name.to_string_lossy()))
            .unwrap_or(false)
    }

    /// Enumerate matching files and seek each to its current end. Called
    /// once at start so historical content is not replayed.
    pub(crate) fn discover(&self) {
        let glob_path = if self.watch.recursive {
            self.watch.path.join("**").join(&self.watch.pattern)
        } else {
            self.watch.path.join(&self.watch.pattern)
        };
        let Some(glob_str) = glob_path.to_str() else {
            warn!(message = "Watch path is not valid UTF-8; skipping discovery.", path = ?self.watch.path);
            return;
        };
        match glob::glob(glob_str) {
            Ok(entries) => {
                let mut offsets = self.offsets.lock().expect("offset table poisoned");
                for path in entries.flatten() {
                    if !path.is_file() {
                        continue;
                    }
                    if let Ok(metadata) = path.metadata() {
                        debug!(message = "Tracking existing file from its end.", ?path, size = metadata.len());
                        offsets.insert(path, metadata.len());
                    }
                }
            }
            Err(error) => {
                warn!(message = "Failed to enumerate watch path.", path = ?self.watch.path, %error);
            }
        }
    }

    /// Translate one notify event into the tailer's policy table.
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
                    self.on_removed(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    self.on_created(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                // The platform did not say which side of the rename this is.
                for path in &event.paths {
                    if path.is_file() {
                        self.on_modified(path);
                    } else {
                        self.on_removed(path);
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
                    self.on_removed(path);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn on_created(&self, path: &Path) {
        if !self.matches(path) || !path.is_file() {
            return;
        }
        debug!(message = "File created.", ?path);
        {
            let mut offsets = self.offsets.lock().expect("offset table poisoned");
            offsets.insert(path.to_path_buf(), 0);
        }
        self.drain(path);
    }

    pub(crate) fn on_modified(&self, path: &Path) {
        if !self.matches(path) || !path.is_file() {
            return;
        }
        self.drain(path);
    }

    pub(crate) fn on_moved(&self, src: &Path, dst: &Path) {
        debug!(message = "File moved.", ?src, ?dst);
        {
            let mut offsets = self.offsets.lock().expect("offset table poisoned");
            if let Some(offset) = offsets.remove(src) {
                if self.matches(dst) {
                    offsets.insert(dst.to_path_buf(), offset);
                }
            }
        }
        if self.matches(dst) && dst.is_file() {
            self.drain(dst);
        }
    }

    pub(crate) fn on_removed(&self, path: &Path) {
        let mut offsets = self.offsets.lock().expect("offset table poisoned");
        if offsets.remove(path).is_some() {
            debug!(message = "Stopped tracking removed file.", ?path);
        }
    }

    /// One sweep from the stored offset to EOF, emitting a record per line.
    pub(crate) fn drain(&self, path: &Path) {
        if let Err(error) = self.drain_file(path) {
            // Offset untouched; the next event retries this file.
            warn!(message = "Failed to read watched file.", ?path, %error);
        }
    }

    fn drain_file(&self, path: &Path) -> io::Result<()> {
        let mut offsets = self.offsets.lock().expect("offset table poisoned");
        let stored = offsets.get(path).copied().unwrap_or(0);

        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let start = if size < stored {
            debug!(
                message = "File shrank below stored offset; reading from the top.",
                ?path,
                stored,
                size,
            );
            0
        } else {
            stored
        };

        file.seek(SeekFrom::Start(start))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let position = start + bytes.len() as u64;

        // One timestamp per drain pass.
        let timestamp = now_timestamp();
        let file_path = path.to_string_lossy();
        let text = String::from_utf8_lossy(&bytes);
        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                continue;
            }
            self.sink.log(LogRecord::tailed(
                timestamp.clone(),
                &self.hostname,
                &file_path,
                line.to_owned(),
                self.record_metadata(),
            ));
        }

        offsets.insert(path.to_path_buf(), position);
        Ok(())
    }

    fn record_metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("watch_path".into(), json!(self.watch.path.to_string_lossy()));
        metadata.insert("pattern".into(), json!(self.watch.pattern));
        metadata
    }

    #[cfg(test)]
    fn offset(&self, path: &Path) -> Option<u64> {
        self.offsets.lock().unwrap().get(path).copied()
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    watchers: Vec<RecommendedWatcher>,
    threads: Vec<thread::JoinHandle<()>>,
}

/// Watches the configured roots and feeds new log lines into the sink.
///
/// A construct-then-`start`/`stop` handle; both operations are idempotent.
pub struct Tailer {
    watches: Vec<WatchPath>,
    hostname: String,
    sink: EventSink,
    state: Mutex<Option<Running>>,
}

impl Tailer {
    pub fn new(watches: Vec<WatchPath>, hostname: &str, sink: EventSink) -> Self {
        Tailer {
            watches,
            hostname: hostname.to_owned(),
            sink,
            state: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut state = self.state.lock().expect("tailer state poisoned");
        if state.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut watchers = Vec::new();
        let mut threads = Vec::new();

        for watch in self.watches.iter().filter(|watch| watch.enabled) {
            if !watch.path.is_dir() {
                warn!(message = "Watch path does not exist.", path = ?watch.path);
                continue;
            }

            let handler = Arc::new(WatchHandler::new(
                watch.clone(),
                &self.hostname,
                self.sink.clone(),
            ));
            handler.discover();

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
                warn!(message = "Failed to watch path.", path = ?watch.path, %error);
                continue;
            }

            info!(message = "Watching path for log files.", path = ?watch.path, pattern = %watch.pattern);
            let stop_flag = Arc::clone(&stop);
            threads.push(thread::spawn(move || run_event_loop(rx, handler, stop_flag)));
            watchers.push(watcher);
        }

        *state = Some(Running {
            stop,
            watchers,
            threads,
        });
        info!(message = "File tailer started.");
    }

    pub fn stop(&self) {
        let running = self.state.lock().expect("tailer state poisoned").take();
        let Some(running) = running else {
            return;
        };
        running.stop.store(true, Ordering::SeqCst);
        // Dropping the watchers closes the event channels.
        drop(running.watchers);
        for thread in running.threads {
            if thread.join().is_err() {
                warn!(message = "Tailer worker panicked.");
            }
        }
        info!(message = "File tailer stopped.");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("tailer state poisoned").is_some()
    }

    /// The enabled watch roots.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watches
            .iter()
            .filter(|watch| watch.enabled)
            .map(|watch| watch.path.clone())
            .collect()
    }
}

fn run_event_loop(
    rx: Receiver<Result<notify::Event, notify::Error>>,
    handler: Arc<WatchHandler>,
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

//! The supervisor: owns every component's lifetime, the single-instance
//! lock, and the pause gate.
//!
//! Start order is buffer, shipper, tailer, FIM; stop reverses it. Both are
//! idempotent. While paused, collectors keep running and their offsets and
//! baselines keep advancing, but nothing reaches the buffer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use snafu::{ensure, ResultExt, Snafu};
use tracing::{info, warn};

use crate::baseline::{BaselineError, BaselineStore};
use crate::buffer::{BufferError, EventBuffer};
use crate::config::{Config, ConfigError};
use crate::fim::Fim;
use crate::shipper::{
    ConnectionStatus, NotificationCallback, Shipper, ShipperStats, StatusCallback,
};
use crate::sink::EventSink;
use crate::tailer::Tailer;
use crate::AGENT_SOURCE;

#[derive(Debug, Snafu)]
pub enum AgentError {
    #[snafu(display("another agent instance is already running"))]
    AlreadyRunning,

    #[snafu(display("failed to acquire instance lock at {}: {}", path.display(), source))]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{}", source))]
    Buffer { source: BufferError },

    #[snafu(display("{}", source))]
    Baseline { source: BaselineError },

    #[snafu(display("failed to resolve agent data directory: {}", source))]
    DataDir { source: ConfigError },
}

/// Advisory lock ensuring a single agent per host. The lock file carries the
/// owning PID; a second start must fail fast without touching the holder's
/// state.
pub struct InstanceLock {
    path: PathBuf,
    lock: Option<fslock::LockFile>,
}

impl InstanceLock {
    pub fn new(path: PathBuf) -> Self {
        InstanceLock { path, lock: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock. `Ok(false)` means another process holds it.
    pub fn acquire(&mut self) -> std::io::Result<bool> {
        if self.lock.is_some() {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lock = fslock::LockFile::open(&self.path)?;
        if !lock.try_lock_with_pid()? {
            return Ok(false);
        }
        self.lock = Some(lock);
        Ok(true)
    }

    pub fn release(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            if let Err(error) = lock.unlock() {
                warn!(message = "Failed to release instance lock.", %error);
            }
        }
    }
}

struct Verifier {
    tx: mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Point-in-time view of the whole agent.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub running: bool,
    pub paused: bool,
    pub configured: bool,
    pub shipper: ShipperStats,
}

/// Orchestrates the tailer, the integrity monitor, and the shipper around
/// the shared durable buffer.
pub struct Agent {
    config: Config,
    paused: Arc<AtomicBool>,
    buffer: Arc<EventBuffer>,
    shipper: Shipper,
    tailer: Tailer,
    fim: Arc<Fim>,
    lock: Mutex<InstanceLock>,
    running: AtomicBool,
    verifier: Mutex<Option<Verifier>>,
}

impl Agent {
    /// Build an agent using the platform data directory and callbacks that
    /// log status changes and notifications.
    pub fn new(config: Config) -> Result<Self, AgentError> {
        let data_dir = Config::data_dir().context(DataDirSnafu)?;
        Self::with_data_dir(config, data_dir)
    }

    /// As [`Agent::new`] with an explicit data directory.
    pub fn with_data_dir(config: Config, data_dir: PathBuf) -> Result<Self, AgentError> {
        let on_status_change: StatusCallback = Box::new(|status: ConnectionStatus| {
            info!(message = "Server connection status.", %status);
        });
        let on_notification: NotificationCallback = Box::new(|title, message, severity| {
            info!(
                message = "Alert notification from server.",
                title,
                body = message,
                severity,
            );
        });
        Self::with_observers(
            config,
            data_dir,
            Some(on_status_change),
            Some(on_notification),
        )
    }

    /// Full-control constructor for embedders that want their own observer
    /// callbacks.
    pub fn with_observers(
        config: Config,
        data_dir: PathBuf,
        on_status_change: Option<StatusCallback>,
        on_notification: Option<NotificationCallback>,
    ) -> Result<Self, AgentError> {
        let buffer =
            Arc::new(EventBuffer::open(&data_dir.join("buffer.db")).context(BufferSnafu)?);
        let baseline =
            Arc::new(BaselineStore::open(&data_dir.join("baseline.db")).context(BaselineSnafu)?);

        let paused = Arc::new(AtomicBool::new(false));
        let sink = EventSink::new(Arc::clone(&buffer), Arc::clone(&paused));

        let shipper = Shipper::new(
            &config,
            Arc::clone(&buffer),
            on_status_change,
            on_notification,
        );
        let tailer = Tailer::new(config.watch_paths.clone(), &config.hostname, sink.clone());
        let fim = Arc::new(Fim::new(
            config.fim_paths.clone(),
            config.fim_enabled,
            &config.hostname,
            baseline,
            sink,
        ));
        let lock = InstanceLock::new(data_dir.join(format!("{AGENT_SOURCE}.lock")));

        Ok(Agent {
            config,
            paused,
            buffer,
            shipper,
            tailer,
            fim,
            lock: Mutex::new(lock),
            running: AtomicBool::new(false),
            verifier: Mutex::new(None),
        })
    }

    /// Start every component. Idempotent; fails with
    /// [`AgentError::AlreadyRunning`] when another process holds the
    /// instance lock.
    pub fn start(&self) -> Result<(), AgentError> {
        if self.running.load(Ordering::SeqCst) {
            warn!(message = "Agent already running.");
            return Ok(());
        }

        {
            let mut lock = self.lock.lock().expect("instance lock poisoned");
            let path = lock.path().to_path_buf();
            let acquired = lock.acquire().context(LockSnafu { path })?;
            ensure!(acquired, AlreadyRunningSnafu);
        }

        info!(message = "Starting agent.");
        if !self.config.is_configured() {
            warn!(
                message =
                    "Agent not fully configured; shipping will fail until server_url and api_key are set."
            );
        }

        self.shipper.start();
        if !self.config.watch_paths.is_empty() {
            self.tailer.start();
        }
        if self.config.fim_enabled && !self.config.fim_paths.is_empty() {
            self.fim.start();
        }
        self.start_verifier();

        self.running.store(true, Ordering::SeqCst);
        info!(
            message = "Agent started.",
            server = %self.config.server_url,
            hostname = %self.config.hostname,
            watch_paths = self.config.watch_paths.len(),
            fim_enabled = self.config.fim_enabled,
        );
        Ok(())
    }

    /// Stop every component in reverse start order. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(message = "Stopping agent.");
        self.stop_verifier();
        self.fim.stop();
        self.tailer.stop();
        self.shipper.stop();
        self.lock.lock().expect("instance lock poisoned").release();
        info!(message = "Agent stopped.");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Gate enqueues. Collectors keep observing filesystem events, so
    /// offsets advance and resuming does not replay.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!(message = "Agent paused.");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!(message = "Agent resumed.");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            running: self.is_running(),
            paused: self.is_paused(),
            configured: self.config.is_configured(),
            shipper: self.shipper.stats(),
        }
    }

    pub fn buffer(&self) -> Arc<EventBuffer> {
        Arc::clone(&self.buffer)
    }

    /// The integrity monitor, e.g. for an on-demand `verify_baseline` call.
    pub fn fim(&self) -> &Fim {
        &self.fim
    }

    fn start_verifier(&self) {
        let Some(seconds) = self.config.fim_verify_interval_seconds else {
            return;
        };
        if seconds == 0 || !self.config.fim_enabled {
            return;
        }
        let interval = Duration::from_secs(seconds);
        let fim = Arc::clone(&self.fim);
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    fim.verify_baseline();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        *self.verifier.lock().expect("verifier lock poisoned") = Some(Verifier { tx, thread });
        info!(message = "Scheduled periodic baseline verification.", interval_seconds = seconds);
    }

    fn stop_verifier(&self) {
        let verifier = self.verifier.lock().expect("verifier lock poisoned").take();
        if let Some(Verifier { tx, thread }) = verifier {
            let _ = tx.send(());
            if thread.join().is_err() {
                warn!(message = "Verifier thread panicked.");
            }
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Batched HTTP shipper.
//!
//! A single worker thread runs a current-thread async loop that drains the
//! durable buffer into `POST /api/ingest/agent` batches, tracks connection
//! state, backs off exponentially on failure, and polls the server for
//! pending notifications while connected.
//!
//! Entries leave the buffer only on a `2xx` acknowledgement or when their
//! attempt counter reaches the poison threshold. A `401` is a durable
//! authentication failure: the shipper keeps retrying without consuming
//! attempt counts, so an auth outage can never poison unsent events.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferedEntry, EventBuffer, EventKind};
use crate::config::Config;
use crate::event::{Event, FimRecord, LogRecord};

/// Entries whose attempt counter reaches this are evicted so a poisoned
/// batch cannot stall the queue. Deliberately separate from the configured
/// `retry_max_attempts`, which only bounds the backoff ceiling.
pub const POISON_THRESHOLD: u32 = 10;

const POST_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const NOTIFICATION_POLL_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_INTERVAL: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Connection state as observed by the supervisor. Every transition is
/// reported exactly once to the registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Error => f.write_str("error"),
        }
    }
}

pub type StatusCallback = Box<dyn Fn(ConnectionStatus) + Send + Sync>;
/// `(title, message, severity)` of a server-initiated notification.
pub type NotificationCallback = Box<dyn Fn(&str, &str, &str) + Send + Sync>;

/// Snapshot of shipper counters. `events_failed` counts attempts, not
/// unique records.
#[derive(Debug, Clone)]
pub struct ShipperStats {
    pub status: ConnectionStatus,
    pub events_sent: u64,
    pub events_failed: u64,
    pub events_buffered: u64,
    pub last_send_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Clone)]
struct Settings {
    server_url: String,
    api_key: String,
    hostname: String,
    batch_size: usize,
    batch_interval: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Settings {
    fn from_config(config: &Config) -> Self {
        let initial_backoff = Duration::from_secs_f64(config.retry_backoff_seconds.max(0.0));
        let doublings = 2u32.checked_pow(config.retry_max_attempts).unwrap_or(u32::MAX);
        let max_backoff = initial_backoff.saturating_mul(doublings).min(MAX_BACKOFF);
        Settings {
            server_url: config.server_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            hostname: config.hostname.clone(),
            batch_size: config.batch_size,
            batch_interval: Duration::from_secs_f64(config.batch_interval_seconds.max(0.0)),
            initial_backoff,
            max_backoff,
        }
    }
}

#[derive(Default)]
struct StatsInner {
    events_sent: u64,
    events_failed: u64,
    last_send_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Shared {
    settings: Settings,
    buffer: Arc<EventBuffer>,
    status: Mutex<ConnectionStatus>,
    stats: Mutex<StatsInner>,
    on_status_change: Option<StatusCallback>,
    on_notification: Option<NotificationCallback>,
}

impl Shared {
    fn status(&self) -> ConnectionStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    fn set_status(&self, next: ConnectionStatus) {
        let mut current = self.status.lock().expect("status lock poisoned");
        if *current == next {
            return;
        }
        *current = next;
        drop(current);
        info!(message = "Connection status changed.", status = %next);
        if let Some(callback) = &self.on_status_change {
            callback(next);
        }
    }

    fn note_success(&self, delivered: usize) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.events_sent += delivered as u64;
        stats.last_send_time = Some(Utc::now());
        stats.last_error = None;
    }

    fn note_failure(&self, attempted: usize, error: impl Into<String>) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.events_failed += attempted as u64;
        stats.last_error = Some(error.into());
    }
}

enum SendOutcome {
    Delivered,
    AuthRejected(String),
    /// The request never left the host: missing configuration or a locally
    /// invalid request. Never consumes attempt counts.
    Configuration(String),
    Rejected(StatusCode),
    Transport(String),
}

#[derive(Debug, Deserialize)]
struct NotificationList {
    #[serde(default)]
    notifications: Vec<Notification>,
}

#[derive(Debug, Deserialize)]
struct Notification {
    id: String,
    #[serde(default = "default_notification_title")]
    title: String,
    #[serde(default)]
    message: String,
    #[serde(default = "default_notification_severity")]
    severity: String,
}

fn default_notification_title() -> String {
    "LogNog Alert".to_owned()
}

fn default_notification_severity() -> String {
    "medium".to_owned()
}

struct Worker {
    shared: Arc<Shared>,
    client: reqwest::Client,
    backoff: Duration,
    last_notification_poll: Option<Instant>,
}

impl Worker {
    fn new(shared: Arc<Shared>, client: reqwest::Client) -> Self {
        let backoff = shared.settings.initial_backoff;
        Worker {
            shared,
            client,
            backoff,
            last_notification_poll: None,
        }
    }

    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            match self.step(&shutdown).await {
                Some(sleep) => {
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                None => break,
            }
        }
    }

    /// One loop iteration. Returns how long to sleep before the next one,
    /// or `None` when shutdown was observed.
    async fn step(&mut self, shutdown: &CancellationToken) -> Option<Duration> {
        let batch = match self.shared.buffer.next_batch(self.shared.settings.batch_size) {
            Ok(batch) => batch,
            Err(error) => {
                error!(message = "Failed to read batch from buffer.", %error);
                self.shared.note_failure(0, error.to_string());
                return Some(IDLE_INTERVAL);
            }
        };

        let mut sleep = IDLE_INTERVAL;
        if !batch.is_empty() {
            self.shared.set_status(ConnectionStatus::Connecting);

            let outcome = {
                let send = self.post_events(&batch);
                tokio::pin!(send);
                tokio::select! {
                    outcome = &mut send => Some(outcome),
                    _ = shutdown.cancelled() => {
                        // Give the in-flight request a bounded chance to
                        // finish; an abandoned batch keeps its attempt count.
                        tokio::time::timeout(SHUTDOWN_GRACE, &mut send).await.ok()
                    }
                }
            };
            let Some(outcome) = outcome else {
                debug!(message = "Abandoning in-flight request at shutdown.");
                return None;
            };

            let ids: Vec<i64> = batch.iter().map(|entry| entry.id).collect();
            match outcome {
                SendOutcome::Delivered => {
                    if let Err(error) = self.shared.buffer.remove(&ids) {
                        error!(message = "Failed to remove acknowledged entries.", %error);
                    }
                    self.shared.note_success(ids.len());
                    self.shared.set_status(ConnectionStatus::Connected);
                    self.backoff = self.shared.settings.initial_backoff;
                    sleep = self.shared.settings.batch_interval;
                    debug!(message = "Batch delivered.", events = ids.len());
                }
                SendOutcome::AuthRejected(reason) => {
                    // Attempts deliberately untouched: an auth outage must
                    // not walk entries toward poison eviction.
                    error!(message = "Authentication failed; check the API key.", %reason);
                    self.shared.note_failure(ids.len(), reason);
                    self.shared.set_status(ConnectionStatus::Error);
                    sleep = self.next_backoff();
                }
                SendOutcome::Configuration(reason) => {
                    // The batch never left the host, so like a 401 this must
                    // not consume attempt counts.
                    error!(message = "Agent misconfigured; cannot send batch.", %reason);
                    self.shared.note_failure(ids.len(), reason);
                    self.shared.set_status(ConnectionStatus::Error);
                    sleep = self.next_backoff();
                }
                SendOutcome::Rejected(status) => {
                    error!(message = "Server rejected batch.", %status);
                    self.bump_and_evict(&ids);
                    self.shared.note_failure(ids.len(), format!("HTTP {status}"));
                    self.shared.set_status(ConnectionStatus::Error);
                    sleep = self.next_backoff();
                }
                SendOutcome::Transport(reason) => {
                    warn!(message = "Failed to reach server.", %reason);
                    self.bump_and_evict(&ids);
                    self.shared.note_failure(ids.len(), reason);
                    self.shared.set_status(ConnectionStatus::Disconnected);
                    sleep = self.next_backoff();
                }
            }
        } else if self.shared.status() != ConnectionStatus::Connected {
            // Nothing to send still tells us nothing about the link; probe.
            if self.probe_health().await {
                self.shared.set_status(ConnectionStatus::Connected);
            } else {
                self.shared.set_status(ConnectionStatus::Disconnected);
            }
        }

        if self.shared.status() == ConnectionStatus::Connected {
            self.maybe_poll_notifications().await;
        }

        if shutdown.is_cancelled() {
            return None;
        }
        Some(sleep)
    }

    fn next_backoff(&mut self) -> Duration {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.shared.settings.max_backoff);
        delay
    }

    fn bump_and_evict(&self, ids: &[i64]) {
        if let Err(error) = self.shared.buffer.bump_attempts(ids) {
            error!(message = "Failed to bump attempt counters.", %error);
            return;
        }
        match self.shared.buffer.evict_poison(POISON_THRESHOLD) {
            Ok(0) => {}
            Ok(evicted) => warn!(message = "Evicted poison entries.", evicted),
            Err(error) => error!(message = "Failed to evict poison entries.", %error),
        }
    }

    async fn post_events(&self, batch: &[BufferedEntry]) -> SendOutcome {
        let settings = &self.shared.settings;
        if settings.server_url.is_empty() {
            return SendOutcome::Configuration("no server URL configured".to_owned());
        }
        if settings.api_key.is_empty() {
            return SendOutcome::AuthRejected("no API key configured".to_owned());
        }

        let mut events = Vec::with_capacity(batch.len());
        for entry in batch {
            let event = match entry.kind {
                EventKind::Log => {
                    serde_json::from_str::<LogRecord>(&entry.payload).map(Event::Log)
                }
                EventKind::Fim => {
                    serde_json::from_str::<FimRecord>(&entry.payload).map(Event::Fim)
                }
            };
            match event {
                Ok(event) => events.push(event),
                Err(error) => {
                    warn!(message = "Dropping undecodable buffered entry.", id = entry.id, %error);
                }
            }
        }

        let url = format!("{}/api/ingest/agent", settings.server_url);
        let result = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("ApiKey {}", settings.api_key))
            .json(&json!({ "events": events }))
            .timeout(POST_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    SendOutcome::Delivered
                } else if status == StatusCode::UNAUTHORIZED {
                    SendOutcome::AuthRejected("authentication failed".to_owned())
                } else {
                    SendOutcome::Rejected(status)
                }
            }
            // A builder error means the request was never sent (e.g. an
            // unparseable URL); that is misconfiguration, not connectivity.
            Err(error) if error.is_builder() => SendOutcome::Configuration(error.to_string()),
            Err(error) => SendOutcome::Transport(error.to_string()),
        }
    }

    async fn probe_health(&self) -> bool {
        let url = format!("{}/health", self.shared.settings.server_url);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn maybe_poll_notifications(&mut self) {
        if self.shared.on_notification.is_none() || self.shared.settings.api_key.is_empty() {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_notification_poll {
            if now.duration_since(last) < NOTIFICATION_POLL_INTERVAL {
                return;
            }
        }
        self.last_notification_poll = Some(now);
        if let Err(error) = self.poll_notifications().await {
            debug!(message = "Notification poll failed.", %error);
        }
    }

    async fn poll_notifications(&self) -> Result<(), reqwest::Error> {
        let settings = &self.shared.settings;
        let url = format!("{}/api/ingest/notifications", settings.server_url);
        let response = self
            .client
            .get(&url)
            .query(&[("hostname", settings.hostname.as_str())])
            .header(AUTHORIZATION, format!("ApiKey {}", settings.api_key))
            .timeout(NOTIFICATION_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(());
        }

        let list: NotificationList = response.json().await?;
        let count = list.notifications.len();
        for notification in list.notifications {
            if let Some(callback) = &self.shared.on_notification {
                callback(
                    &notification.title,
                    &notification.message,
                    &notification.severity,
                );
            }
            // An ack that fails is logged and not retried this cycle; the
            // server will hand the notification back on the next poll.
            if let Err(error) = self.ack_notification(&notification.id).await {
                debug!(message = "Failed to acknowledge notification.", id = %notification.id, %error);
            }
        }
        if count > 0 {
            info!(message = "Received alert notifications.", count);
        }
        Ok(())
    }

    async fn ack_notification(&self, id: &str) -> Result<(), reqwest::Error> {
        let settings = &self.shared.settings;
        let url = format!("{}/api/ingest/notifications/{}/ack", settings.server_url, id);
        self.client
            .post(&url)
            .header(AUTHORIZATION, format!("ApiKey {}", settings.api_key))
            .json(&json!({ "hostname": settings.hostname }))
            .timeout(ACK_TIMEOUT)
            .send()
            .await?;
        Ok(())
    }
}

struct WorkerHandle {
    shutdown: CancellationToken,
    thread: thread::JoinHandle<()>,
}

/// The shipper component: construct, then `start`/`stop` (both idempotent).
pub struct Shipper {
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Shipper {
    pub fn new(
        config: &Config,
        buffer: Arc<EventBuffer>,
        on_status_change: Option<StatusCallback>,
        on_notification: Option<NotificationCallback>,
    ) -> Self {
        Shipper {
            shared: Arc::new(Shared {
                settings: Settings::from_config(config),
                buffer,
                status: Mutex::new(ConnectionStatus::Disconnected),
                stats: Mutex::new(StatsInner::default()),
                on_status_change,
                on_notification,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("worker lock poisoned");
        if worker.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let token = shutdown.clone();
        let thread = thread::spawn(move || run_worker(shared, token));
        *worker = Some(WorkerHandle { shutdown, thread });
        info!(message = "HTTP shipper started.");
    }

    pub fn stop(&self) {
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        let Some(WorkerHandle { shutdown, thread }) = handle else {
            return;
        };
        shutdown.cancel();
        if thread.join().is_err() {
            error!(message = "Shipper worker panicked.");
        }
        self.shared.set_status(ConnectionStatus::Disconnected);
        info!(message = "HTTP shipper stopped.");
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().expect("worker lock poisoned").is_some()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    pub fn stats(&self) -> ShipperStats {
        let stats = self.shared.stats.lock().expect("stats lock poisoned");
        ShipperStats {
            status: self.shared.status(),
            events_sent: stats.events_sent,
            events_failed: stats.events_failed,
            events_buffered: self.shared.buffer.count().unwrap_or(0),
            last_send_time: stats.last_send_time,
            last_error: stats.last_error.clone(),
        }
    }
}

fn run_worker(shared: Arc<Shared>, shutdown: CancellationToken) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(message = "Failed to build shipper runtime.", %error);
            return;
        }
    };
    let client = match reqwest::Client::builder()
        .user_agent(crate::USER_AGENT)
        .pool_max_idle_per_host(5)
        .build()
    {
        Ok(client) => client,
        Err(error) => {
            error!(message = "Failed to build HTTP client.", %error);
            return;
        }
    };
    let worker = Worker::new(shared, client);
    runtime.block_on(worker.run(shutdown));
}

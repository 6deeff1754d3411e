//! Host agent for the LogNog collection server.
//!
//! The agent tails configured log files, monitors file integrity against a
//! hash baseline, and ships both kinds of events to the server over HTTP.
//! Events are staged in a durable on-disk buffer so that network outages,
//! server failures, and agent restarts never lose data.
//!
//! The pipeline, in data-flow order:
//!
//! ```text
//! Tailer ─┐
//!         ├─▶ EventSink (pause gate) ─▶ EventBuffer ─▶ Shipper ─▶ HTTP POST
//! Fim ────┘
//! ```
//!
//! [`Agent`] owns the lifetimes of all components and is the only type most
//! callers need.

#![deny(clippy::all)]

pub mod agent;
pub mod baseline;
pub mod buffer;
pub mod config;
pub mod event;
pub mod fim;
pub mod hash;
pub mod shipper;
pub mod sink;
pub mod tailer;

pub use self::agent::Agent;
pub use self::buffer::EventBuffer;
pub use self::config::Config;
pub use self::event::{Event, FimEventKind, FimRecord, LogRecord};
pub use self::shipper::{ConnectionStatus, Shipper};
pub use self::sink::EventSink;

/// Identity string stamped into every record's `source` field.
pub const AGENT_SOURCE: &str = "lognog-in";

/// `User-Agent` presented to the server.
pub const USER_AGENT: &str = concat!("LogNog-In/", env!("CARGO_PKG_VERSION"));

// src/events/mod.rs

//! Per-session, sequence-numbered event log.
//!
//! - [`model`] defines [`Event`] and the typed [`EventKind`] payloads.
//! - [`log`] assigns sequence numbers and fans events out to subscribers.
//! - [`journal`] persists each session as a JSONL file.
//! - [`emitter`] binds the log to one session / run for producers.

pub mod emitter;
pub mod journal;
pub mod log;
pub mod model;

pub use emitter::EventEmitter;
pub use log::{EventLog, EventSubscription, ReadFilter};
pub use model::{Event, EventKind, EventSource, TaskAction};

// src/events/emitter.rs

use std::sync::Arc;

use crate::errors::Result;
use crate::events::log::EventLog;
use crate::events::model::{Event, EventKind};
use crate::types::{RunId, SessionId};

/// An [`EventLog`] bound to one session (and optionally one run).
#[derive(Debug, Clone)]
pub struct EventEmitter {
    log: Arc<EventLog>,
    session_id: SessionId,
    run_id: Option<RunId>,
}

impl EventEmitter {
    pub fn new(log: Arc<EventLog>, session_id: impl Into<SessionId>, run_id: Option<RunId>) -> Self {
        Self {
            log,
            session_id: session_id.into(),
            run_id,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn emit(&self, kind: EventKind) -> Result<Event> {
        self.log.append(&self.session_id, self.run_id, kind)
    }

    pub fn emit_all(&self, kinds: impl IntoIterator<Item = EventKind>) -> Result<()> {
        for kind in kinds {
            self.emit(kind)?;
        }
        Ok(())
    }
}

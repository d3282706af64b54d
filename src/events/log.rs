// src/events/log.rs

//! Append-only, per-session event log with real-time subscriptions.
//!
//! Each session has its own lock guarding its sequence counter, its
//! in-memory history, its broadcast channel and (optionally) its journal
//! file. Sequence numbers are assigned under that lock, so concurrent
//! emitters in one session never share or skip a `seq`, and sessions never
//! contend with each other.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::EventsSection;
use crate::errors::Result;
use crate::events::journal::{self, Journal};
use crate::events::model::{Event, EventKind};
use crate::types::{RunId, SessionId};

/// Which part of a session's history to read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadFilter {
    /// Only events with `seq > since_seq`.
    pub since_seq: u64,
    /// Only events of this run; original seqs are kept.
    pub run_id: Option<RunId>,
    pub limit: Option<usize>,
}

impl ReadFilter {
    pub fn since(since_seq: u64) -> Self {
        Self {
            since_seq,
            ..Self::default()
        }
    }

    pub fn for_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &Event) -> bool {
        event.seq > self.since_seq && self.run_id.is_none_or(|r| event.run_id == Some(r))
    }
}

#[derive(Debug)]
struct SessionLog {
    last_seq: u64,
    events: Vec<Event>,
    tx: broadcast::Sender<Event>,
    journal: Option<Journal>,
}

impl SessionLog {
    fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            last_seq: 0,
            events: Vec::new(),
            tx,
            journal: None,
        }
    }

    fn read(&self, filter: &ReadFilter) -> Vec<Event> {
        // `events` is sorted by seq, so skip the prefix by binary search.
        let start = self.events.partition_point(|e| e.seq <= filter.since_seq);
        let iter = self.events[start..]
            .iter()
            .filter(|e| filter.matches(e))
            .cloned();
        match filter.limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }
}

type SessionHandle = Arc<Mutex<SessionLog>>;

fn lock(session: &Mutex<SessionLog>) -> MutexGuard<'_, SessionLog> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The event log shared by the scheduler, the run manager and the API.
#[derive(Debug)]
pub struct EventLog {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
    buffer: usize,
    journal_dir: Option<PathBuf>,
}

impl EventLog {
    /// Memory-only log.
    pub fn in_memory(buffer: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            journal_dir: None,
        }
    }

    /// Log backed by JSONL journals under `dir`.
    ///
    /// Existing journals are replayed: history, sequence counters and the
    /// event id counter continue where the previous process stopped.
    pub fn open(dir: &Path, buffer: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut log = Self::in_memory(buffer);
        log.journal_dir = Some(dir.to_path_buf());

        let mut max_id = 0;
        let mut restored: HashMap<SessionId, SessionLog> = HashMap::new();
        for path in journal::journal_files(dir)? {
            for event in journal::replay_file(&path)? {
                max_id = max_id.max(event.id);
                let session = restored
                    .entry(event.session_id.clone())
                    .or_insert_with(|| SessionLog::new(log.buffer));
                session.last_seq = session.last_seq.max(event.seq);
                session.events.push(event);
            }
        }

        let sessions = log.sessions.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (session_id, mut session) in restored {
            session.events.sort_by_key(|e| e.seq);
            session.events.dedup_by_key(|e| e.seq);
            debug!(session = %session_id, last_seq = session.last_seq, "session restored");
            sessions.insert(session_id, Arc::new(Mutex::new(session)));
        }
        info!(dir = %dir.display(), sessions = sessions.len(), "event journal opened");

        log.next_id = AtomicU64::new(max_id + 1);
        Ok(log)
    }

    pub fn from_config(cfg: &EventsSection) -> Result<Self> {
        match &cfg.journal_dir {
            Some(dir) => Self::open(dir, cfg.subscriber_buffer),
            None => Ok(Self::in_memory(cfg.subscriber_buffer)),
        }
    }

    fn session(&self, session_id: &str) -> SessionHandle {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionLog::new(self.buffer))))
            .clone()
    }

    fn existing(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Append an event and return it with its assigned `seq`.
    ///
    /// The event is journaled (when durable) before subscribers see it.
    pub fn append(&self, session_id: &str, run_id: Option<RunId>, kind: EventKind) -> Result<Event> {
        let handle = self.session(session_id);
        let mut session = lock(&handle);

        let event = Event {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            session_id: session_id.to_string(),
            seq: session.last_seq + 1,
            run_id,
            source: kind.source(),
            kind,
            created_at: Utc::now(),
        };

        if let Some(dir) = &self.journal_dir {
            if session.journal.is_none() {
                session.journal = Some(Journal::open(dir, session_id)?);
            }
        }
        if let Some(journal) = session.journal.as_mut() {
            journal.append(&event)?;
        }

        session.last_seq = event.seq;
        session.events.push(event.clone());
        // No receivers is fine.
        let _ = session.tx.send(event.clone());

        debug!(
            session = %session_id,
            seq = event.seq,
            kind = event.type_name(),
            "event appended"
        );
        Ok(event)
    }

    /// Ordered replay of a session's history.
    pub fn read(&self, session_id: &str, filter: &ReadFilter) -> Vec<Event> {
        match self.existing(session_id) {
            Some(handle) => lock(&handle).read(filter),
            None => Vec::new(),
        }
    }

    /// Highest `seq` assigned in the session so far (0 if none).
    pub fn last_seq(&self, session_id: &str) -> u64 {
        self.existing(session_id)
            .map(|h| lock(&h).last_seq)
            .unwrap_or(0)
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Events appended from now on.
    pub fn subscribe(&self, session_id: &str) -> EventSubscription {
        let handle = self.session(session_id);
        let session = lock(&handle);
        EventSubscription {
            rx: session.tx.subscribe(),
            backlog: VecDeque::new(),
            last_seq: session.last_seq,
            run_id: None,
            session: Arc::downgrade(&handle),
        }
    }

    /// Every event with `seq > since_seq` followed by live events, without
    /// gaps or duplicates.
    ///
    /// The backlog snapshot and the channel subscription are taken under the
    /// session lock, so no append can fall between them.
    pub fn subscribe_from(&self, session_id: &str, filter: ReadFilter) -> EventSubscription {
        let handle = self.session(session_id);
        let session = lock(&handle);
        let backlog = session.read(&ReadFilter {
            limit: None,
            ..filter.clone()
        });
        EventSubscription {
            rx: session.tx.subscribe(),
            backlog: backlog.into(),
            last_seq: filter.since_seq,
            run_id: filter.run_id,
            session: Arc::downgrade(&handle),
        }
    }

    /// Drop a session's history and journal. Open subscriptions end once
    /// they have drained what they already hold.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);

        if let Some(dir) = &self.journal_dir {
            let path = journal::journal_path(dir, session_id);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }

        if removed.is_some() {
            info!(session = %session_id, "event history deleted");
        }
        Ok(removed.is_some())
    }
}

/// A live, ordered view of one session's events.
///
/// A subscriber that falls behind the broadcast buffer backfills the
/// missed range from the session history instead of losing events.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    backlog: VecDeque<Event>,
    last_seq: u64,
    run_id: Option<RunId>,
    session: Weak<Mutex<SessionLog>>,
}

impl EventSubscription {
    /// Next event, or `None` once the session has been deleted.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                self.last_seq = event.seq;
                return Some(event);
            }

            match self.rx.recv().await {
                Ok(event) => {
                    if event.seq <= self.last_seq {
                        continue;
                    }
                    self.last_seq = event.seq;
                    if self.run_id.is_some_and(|r| event.run_id != Some(r)) {
                        continue;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, last_seq = self.last_seq, "subscriber lagged; backfilling");
                    let session = self.session.upgrade()?;
                    let missed = lock(&session).read(&ReadFilter {
                        since_seq: self.last_seq,
                        run_id: self.run_id,
                        limit: None,
                    });
                    self.backlog.extend(missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Same as [`Self::recv`], but returns immediately with `None` when no
    /// event is buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                self.last_seq = event.seq;
                return Some(event);
            }
            match self.rx.try_recv() {
                Ok(event) if event.seq <= self.last_seq => continue,
                Ok(event) => {
                    self.last_seq = event.seq;
                    if self.run_id.is_some_and(|r| event.run_id != Some(r)) {
                        continue;
                    }
                    return Some(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    let session = self.session.upgrade()?;
                    let missed = lock(&session).read(&ReadFilter {
                        since_seq: self.last_seq,
                        run_id: self.run_id,
                        limit: None,
                    });
                    self.backlog.extend(missed);
                }
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Event> {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

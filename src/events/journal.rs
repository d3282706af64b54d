// src/events/journal.rs

//! Durable JSONL journal: one file per session, one event per line.

use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::Result;
use crate::events::model::Event;

/// Append handle for a single session's journal file.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open (or create) the journal of `session_id` under `dir`.
    ///
    /// A torn trailing line is cut off so new events start on a fresh line.
    pub fn open(dir: &Path, session_id: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = journal_path(dir, session_id);
        truncate_torn_tail(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one event and flush it before returning.
    pub fn append(&mut self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        Ok(())
    }
}

fn truncate_torn_tail(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let bytes = fs::read(path)?;
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(());
    }

    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    warn!(path = %path.display(), dropped = bytes.len() - keep, "truncating torn journal tail");
    OpenOptions::new().write(true).open(path)?.set_len(keep as u64)?;
    Ok(())
}

/// File name for a session.
///
/// `[A-Za-z0-9-]` is kept as is; every other byte (including `_`) becomes
/// `_` plus two hex digits, so distinct session ids never share a file.
pub fn journal_path(dir: &Path, session_id: &str) -> PathBuf {
    let mut name = String::with_capacity(session_id.len() + 6);
    for b in session_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            name.push(char::from(b));
        } else {
            let _ = write!(name, "_{b:02x}");
        }
    }
    name.push_str(".jsonl");
    dir.join(name)
}

/// Read every event of one journal file.
///
/// A torn trailing line (crash mid-write) is skipped with a warning; a
/// malformed line anywhere else is an error.
pub fn replay_file(path: &Path) -> Result<Vec<Event>> {
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
    let last = lines.len().saturating_sub(1);

    let mut events = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => events.push(event),
            Err(e) if i == last => {
                warn!(path = %path.display(), error = %e, "skipping torn journal tail");
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!(path = %path.display(), events = events.len(), "journal replayed");
    Ok(events)
}

/// Every `*.jsonl` file directly under `dir`, sorted by name.
pub fn journal_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    files.sort();
    Ok(files)
}

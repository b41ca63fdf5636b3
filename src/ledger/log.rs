//! Append-only run log with crash-safe replay.
//!
//! JSON Lines, one [`RunEvent`] per line. A crash mid-write leaves at most one
//! partial trailing line. Readers skip it; the writer truncates it when it
//! reopens the log, so appends always continue a valid prefix.
//!
//! Critical events are fsync'd before `append` returns.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use super::event::{RunEvent, RunEventPayload};
use super::fsync::fsync_file;

/// Errors that can occur during run log operations.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for run log operations.
pub type Result<T> = std::result::Result<T, EventLogError>;

/// The valid prefix of a log file.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<RunEvent>,
    pub next_seq: u64,
    /// Length of the valid prefix in bytes.
    pub valid_len: u64,
    /// Length of the file when it was read.
    pub file_len: u64,
}

impl Replay {
    /// True if the file ends in a partial or out-of-sequence line.
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// An append-only log for one run.
pub struct EventLog {
    file: File,
    next_seq: u64,
}

impl EventLog {
    /// Opens a log for appending, creating it if needed.
    ///
    /// A torn tail left by a crash is truncated first, so the next event
    /// continues the sequence of the last valid one. Only the writer may do
    /// this; readers use [`EventLog::replay`].
    pub fn open_for_append(path: impl AsRef<Path>) -> Result<(Self, Replay)> {
        let path = path.as_ref();
        let replay = Self::replay(path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        if replay.has_torn_tail() {
            warn!(
                path = %path.display(),
                dropped = replay.file_len - replay.valid_len,
                "truncating torn tail of run log"
            );
            file.set_len(replay.valid_len)?;
            fsync_file(&file)?;
        }

        let log = EventLog {
            file,
            next_seq: replay.next_seq,
        };
        Ok((log, replay))
    }

    /// Appends an event, assigning the next sequence number and the current time.
    pub fn append(&mut self, payload: RunEventPayload) -> Result<RunEvent> {
        let event = RunEvent {
            seq: self.next_seq,
            ts: Utc::now(),
            payload,
        };

        let json = serde_json::to_string(&event)?;
        writeln!(self.file, "{}", json)?;

        if event.is_critical() {
            fsync_file(&self.file)?;
        }

        self.next_seq += 1;
        Ok(event)
    }

    /// Reads the valid prefix of a log without modifying the file.
    ///
    /// A missing file is an empty log. Reading stops at the first line that
    /// fails to parse (a partial write) or whose sequence number does not
    /// increase (corruption).
    pub fn replay(path: impl AsRef<Path>) -> Result<Replay> {
        let file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut events = Vec::new();
        let mut valid_len = 0;
        let mut current_pos = 0;
        let mut max_seq: Option<u64> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = match reader.read_line(&mut line) {
                Ok(n) => n,
                // Torn multi-byte character at EOF.
                Err(e) if e.kind() == io::ErrorKind::InvalidData => break,
                Err(e) => return Err(e.into()),
            };
            if bytes_read == 0 {
                break;
            }
            current_pos += bytes_read as u64;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                valid_len = current_pos;
                continue;
            }

            // A line without its newline was cut short, even if it happens
            // to parse.
            if !line.ends_with('\n') {
                break;
            }

            match serde_json::from_str::<RunEvent>(trimmed) {
                Ok(event) if max_seq.is_some_and(|prev| event.seq <= prev) => break,
                Ok(event) => {
                    max_seq = Some(event.seq);
                    events.push(event);
                    valid_len = current_pos;
                }
                Err(_) => break,
            }
        }

        Ok(Replay {
            events,
            next_seq: max_seq.map(|s| s + 1).unwrap_or(0),
            valid_len,
            file_len,
        })
    }
}

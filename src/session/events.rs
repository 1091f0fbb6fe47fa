//! Append-only JSONL session log.
//!
//! Round tasks emit [`SessionEvent`]s through a cloneable [`EventSink`]; a single blocking
//! writer appends them to the log file in arrival order. A later session replays the log to
//! pick up the groups that timed out before.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::catalog::GroupId;
use crate::planning::RoundId;

/// Event emitted while a session runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Rounds are about to be dispatched.
    SessionStarted {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Number of planned rounds.
        rounds: usize,
        /// Number of scheduled mutations.
        mutations: usize,
        /// Groups excluded from the start.
        #[serde(default)]
        excluded_groups: Vec<GroupId>,
    },
    /// A round ran to completion.
    RoundFinished {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Round id.
        round_id: RoundId,
        /// Replica the round ran on.
        replica: usize,
        /// Mutations applied.
        applied: usize,
        /// Mutations skipped as excluded.
        excluded: usize,
        /// Mutations that could not be re-derived.
        unresolvable: usize,
        /// Tests executed.
        tests: usize,
        /// Round runtime in milliseconds.
        duration_ms: u64,
    },
    /// A round failed and was counted as such.
    RoundFailed {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Round id.
        round_id: RoundId,
        /// Failure detail.
        reason: String,
    },
    /// A group was excluded for the rest of the session.
    GroupTimedOut {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Excluded group.
        group_id: GroupId,
        /// Round that timed out.
        round_id: RoundId,
        /// Members of the group in that round.
        #[serde(default)]
        members: Vec<String>,
    },
    /// Every dispatched round finished.
    SessionCompleted {
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Rounds completed, failed ones included.
        completed: usize,
        /// Rounds failed.
        failed: usize,
        /// Rounds never dispatched.
        skipped: usize,
        /// Whether dispatch stopped on interrupt.
        interrupted: bool,
    },
}

/// Event log errors.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// IO failure.
    #[error("event log io error on {path}: {source}")]
    Io {
        /// Log path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The writer task stopped abnormally.
    #[error("event log writer stopped: {0}")]
    Writer(String),
}

/// Cloneable handle for emitting events. A disabled sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    /// Sink that records nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Queue an event for the writer.
    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                warn!("event log writer is gone; dropping event");
            }
        }
    }
}

/// Open event log with its writer task.
#[derive(Debug)]
pub struct EventLog {
    sink: EventSink,
    writer: JoinHandle<Result<usize, EventLogError>>,
}

impl EventLog {
    /// Open `path` for appending and start the writer. Must be called inside a Tokio runtime.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, EventLogError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| EventLogError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| EventLogError::Io {
                path: path.clone(),
                source,
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = tokio::task::spawn_blocking(move || -> Result<usize, EventLogError> {
            let mut file = file;
            let mut written = 0;
            while let Some(event) = rx.blocking_recv() {
                write_event(&mut file, &event).map_err(|source| EventLogError::Io {
                    path: path.clone(),
                    source,
                })?;
                written += 1;
            }
            Ok(written)
        });

        Ok(Self {
            sink: EventSink { tx: Some(tx) },
            writer,
        })
    }

    /// A sink feeding this log.
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Stop accepting events and wait until every queued event is written.
    ///
    /// Sinks cloned from this log must be dropped first. Returns the number of events written.
    pub async fn close(self) -> Result<usize, EventLogError> {
        drop(self.sink);
        self.writer
            .await
            .map_err(|err| EventLogError::Writer(err.to_string()))?
    }
}

fn write_event(file: &mut File, event: &SessionEvent) -> std::io::Result<()> {
    let json = serde_json::to_string(event).expect("session events should serialize");
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()
}

/// Append one event to `path` synchronously.
pub fn append_event(path: &Path, event: &SessionEvent) -> Result<(), EventLogError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EventLogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    write_event(&mut file, event).map_err(|source| EventLogError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// What a replayed log says about past sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLogReplay {
    /// Groups that timed out in any recorded session.
    pub timed_out_groups: BTreeSet<GroupId>,
    /// Number of sessions started.
    pub sessions: usize,
    /// Number of sessions that reached completion.
    pub completed_sessions: usize,
    /// Number of failed rounds recorded.
    pub failed_rounds: usize,
    /// Number of malformed lines skipped.
    pub malformed_lines: usize,
}

/// Replay an event log.
pub fn replay_events(path: &Path) -> Result<EventLogReplay, EventLogError> {
    let io_err = |source: std::io::Error| EventLogError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);

    let mut replay = EventLogReplay::default();
    for line in reader.lines() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<SessionEvent>(&line) {
            Ok(event) => event,
            Err(_) => {
                replay.malformed_lines += 1;
                continue;
            }
        };

        match event {
            SessionEvent::SessionStarted { .. } => replay.sessions += 1,
            SessionEvent::GroupTimedOut { group_id, .. } => {
                replay.timed_out_groups.insert(group_id);
            }
            SessionEvent::RoundFailed { .. } => replay.failed_rounds += 1,
            SessionEvent::SessionCompleted { .. } => replay.completed_sessions += 1,
            SessionEvent::RoundFinished { .. } => {}
        }
    }

    Ok(replay)
}

/// Groups recorded as timed out in a previous session's log.
pub fn replay_timed_out_groups(path: &Path) -> Result<BTreeSet<GroupId>, EventLogError> {
    replay_events(path).map(|replay| replay.timed_out_groups)
}

/// Current unix timestamp in milliseconds.
pub fn now_timestamp_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

use super::log_buffer::{LogBuffer, LogSlice};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::sync::{Mutex, MutexGuard};
use tokio::process::ChildStdin;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Exited,
    Killed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Killed)
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub command: String,
    pub state: SessionState,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

/// Reported by the first poll that observes a terminal session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub state: SessionState,
    pub exit_code: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResult {
    pub session_id: String,
    pub state: SessionState,
    pub delta: String,
    pub exit_code: Option<i32>,
    pub terminal_event: Option<TerminalEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogView {
    pub session_id: String,
    pub state: SessionState,
    pub content: String,
    pub start_offset: u64,
    pub next_offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillOutcome {
    Signalled,
    AlreadyTerminal,
}

pub(super) struct SessionRecord {
    pub(super) state: SessionState,
    pub(super) exit_code: Option<i32>,
    pub(super) last_activity_at: DateTime<Utc>,
    pub(super) log: LogBuffer,
    pub(super) poll_cursor: u64,
    pub(super) terminal_reported: bool,
    /// Set once the child has been reaped, before its output is drained.
    pub(super) process_exited: bool,
}

pub(super) struct ExecSession {
    pub(super) id: String,
    pub(super) command: String,
    pub(super) owner: Option<String>,
    pub(super) created_at: DateTime<Utc>,
    pub(super) record: Mutex<SessionRecord>,
    pub(super) stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pub(super) cancel: CancellationToken,
    pub(super) done_tx: watch::Sender<bool>,
}

impl ExecSession {
    pub(super) fn new(
        id: String,
        command: String,
        owner: Option<String>,
        log_capacity: usize,
    ) -> Self {
        let now = Utc::now();
        let (done_tx, _) = watch::channel(false);
        Self {
            id,
            command,
            owner,
            created_at: now,
            record: Mutex::new(SessionRecord {
                state: SessionState::Starting,
                exit_code: None,
                last_activity_at: now,
                log: LogBuffer::new(log_capacity),
                poll_cursor: 0,
                terminal_reported: false,
                process_exited: false,
            }),
            stdin: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            done_tx,
        }
    }

    pub(super) fn record(&self) -> MutexGuard<'_, SessionRecord> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn state(&self) -> SessionState {
        self.record().state
    }

    pub(super) fn append_output(&self, chunk: &[u8]) {
        let mut record = self.record();
        record.log.push(chunk);
        record.last_activity_at = Utc::now();
    }

    pub(super) fn summary(&self) -> SessionSummary {
        let record = self.record();
        SessionSummary {
            id: self.id.clone(),
            command: self.command.clone(),
            state: record.state,
            owner: self.owner.clone(),
            created_at: self.created_at,
            last_activity_at: record.last_activity_at,
            exit_code: record.exit_code,
        }
    }

    pub(super) fn poll(&self) -> PollResult {
        let mut record = self.record();
        let LogSlice {
            mut text,
            next_offset,
            skipped,
        } = record.log.read_from(record.poll_cursor, None);
        if skipped > 0 {
            text = format!("[{skipped} bytes dropped from the log buffer]\n{text}");
        }
        record.poll_cursor = next_offset;

        let terminal_event = if record.state.is_terminal() && !record.terminal_reported {
            record.terminal_reported = true;
            Some(TerminalEvent {
                state: record.state,
                exit_code: record.exit_code,
            })
        } else {
            None
        };

        PollResult {
            session_id: self.id.clone(),
            state: record.state,
            delta: text,
            exit_code: record.exit_code,
            terminal_event,
        }
    }

    pub(super) fn log(&self, offset: Option<u64>, limit: Option<usize>) -> LogView {
        let record = self.record();
        let start = offset.unwrap_or_else(|| record.log.start_offset());
        let slice = record.log.read_from(start, limit);
        LogView {
            session_id: self.id.clone(),
            state: record.state,
            content: slice.text,
            start_offset: start.max(record.log.start_offset()),
            next_offset: slice.next_offset,
        }
    }

    pub(super) fn clear_log(&self) {
        let mut record = self.record();
        record.log.clear();
        let end = record.log.end_offset();
        record.poll_cursor = record.poll_cursor.max(end);
    }

    pub(super) fn full_output(&self) -> String {
        self.record().log.contents()
    }

    pub(super) fn mark_process_exited(&self) {
        self.record().process_exited = true;
    }

    /// Marks the session terminal. `killed` is true only when the supervisor
    /// itself tore the process down.
    pub(super) fn finish(&self, exit_code: Option<i32>, killed: bool) -> SessionState {
        let state = {
            let mut record = self.record();
            record.state = if killed {
                SessionState::Killed
            } else {
                SessionState::Exited
            };
            record.exit_code = exit_code;
            record.last_activity_at = Utc::now();
            record.state
        };
        self.done_tx.send_replace(true);
        state
    }
}

//! Execution session manager.
//!
//! Every exec call gets a session. Commands that finish inside the yield
//! window are answered synchronously and forgotten; everything else keeps
//! running under a supervisor task and is controlled through
//! [`ExecSessionManager::process`]. Sessions live only in memory.

mod log_buffer;
mod session;

pub use log_buffer::{LogBuffer, LogSlice};
pub use session::{
    KillOutcome, LogView, PollResult, SessionState, SessionSummary, TerminalEvent,
};

use crate::allowlist::CommandGate;
use crate::config::ExecConfig;
use crate::errors::ExecError;
use crate::events::{EventEmitter, EventKind, RuntimeEvent, emit_quiet};
use serde::{Deserialize, Serialize};
use session::ExecSession;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use uuid::Uuid;

const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    pub background: bool,
    /// `None` uses the configured default yield window.
    pub yield_ms: Option<u64>,
    /// Conversation that started the session.
    pub owner: Option<String>,
    pub workdir: Option<PathBuf>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecOutcome {
    Done {
        output: String,
        exit_code: Option<i32>,
    },
    Running {
        session_id: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProcessAction {
    List,
    Poll {
        session_id: String,
    },
    Log {
        session_id: String,
        #[serde(default)]
        offset: Option<u64>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Write {
        session_id: String,
        data: String,
        #[serde(default)]
        eof: bool,
    },
    Kill {
        session_id: String,
    },
    Clear {
        session_id: String,
    },
    Remove {
        session_id: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProcessResponse {
    Sessions { sessions: Vec<SessionSummary> },
    Poll(PollResult),
    Log(LogView),
    Written { session_id: String, bytes: usize },
    Kill { session_id: String, outcome: KillOutcome },
    Cleared { session_id: String },
    Removed { session_id: String },
}

#[derive(Clone)]
pub struct ExecSessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ExecConfig,
    gate: CommandGate,
    sessions: Mutex<HashMap<String, Arc<ExecSession>>>,
    emitter: Arc<dyn EventEmitter>,
}

impl ExecSessionManager {
    pub fn new(config: ExecConfig, gate: CommandGate, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                gate,
                sessions: Mutex::new(HashMap::new()),
                emitter,
            }),
        }
    }

    pub async fn exec(&self, request: ExecRequest) -> Result<ExecOutcome, ExecError> {
        if let Err(error) = self.inner.gate.check(&request.command) {
            tracing::warn!(command = %request.command, %error, "exec denied by allowlist");
            return Err(error);
        }

        let session_id = format!("sess-{}", Uuid::new_v4().simple());
        let session = Arc::new(ExecSession::new(
            session_id.clone(),
            request.command.clone(),
            request.owner.clone(),
            self.inner.config.log_buffer_bytes,
        ));
        self.sessions().insert(session_id.clone(), session.clone());

        let mut child = match self.spawn_child(&request) {
            Ok(child) => child,
            Err(error) => {
                self.sessions().remove(&session_id);
                return Err(error);
            }
        };

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(session.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(session.clone(), stderr));
        }
        *session.stdin.lock().await = child.stdin.take();
        session.record().state = SessionState::Running;

        tracing::info!(
            session_id = %session_id,
            owner = request.owner.as_deref().unwrap_or("-"),
            command = %request.command,
            "exec session started"
        );
        emit_quiet(
            self.inner.emitter.as_ref(),
            RuntimeEvent::new(EventKind::ExecSessionStart, request.owner.as_deref())
                .with("session_id", session_id.clone())
                .with("command", request.command.clone()),
        );

        let max_runtime = (self.inner.config.max_session_secs > 0)
            .then(|| Duration::from_secs(self.inner.config.max_session_secs));
        tokio::spawn(supervise(
            session.clone(),
            child,
            readers,
            max_runtime,
            self.inner.emitter.clone(),
        ));

        let yield_ms = request
            .yield_ms
            .unwrap_or(self.inner.config.default_yield_ms);
        if request.background || yield_ms == 0 {
            return Ok(ExecOutcome::Running { session_id });
        }

        let mut done = session.done_tx.subscribe();
        let finished = tokio::time::timeout(
            Duration::from_millis(yield_ms),
            done.wait_for(|finished| *finished),
        )
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);

        if !finished {
            tracing::debug!(session_id = %session_id, yield_ms, "yield window elapsed, continuing in background");
            return Ok(ExecOutcome::Running { session_id });
        }

        let output = session.full_output();
        let exit_code = session.record().exit_code;
        self.sessions().remove(&session_id);
        Ok(ExecOutcome::Done { output, exit_code })
    }

    pub async fn process(&self, action: ProcessAction) -> Result<ProcessResponse, ExecError> {
        match action {
            ProcessAction::List => Ok(ProcessResponse::Sessions {
                sessions: self.list(),
            }),
            ProcessAction::Poll { session_id } => self.poll(&session_id).map(ProcessResponse::Poll),
            ProcessAction::Log {
                session_id,
                offset,
                limit,
            } => self.log(&session_id, offset, limit).map(ProcessResponse::Log),
            ProcessAction::Write {
                session_id,
                data,
                eof,
            } => {
                let bytes = self.write(&session_id, &data, eof).await?;
                Ok(ProcessResponse::Written { session_id, bytes })
            }
            ProcessAction::Kill { session_id } => {
                let outcome = self.kill(&session_id)?;
                Ok(ProcessResponse::Kill {
                    session_id,
                    outcome,
                })
            }
            ProcessAction::Clear { session_id } => {
                self.clear(&session_id)?;
                Ok(ProcessResponse::Cleared { session_id })
            }
            ProcessAction::Remove { session_id } => {
                self.remove(&session_id)?;
                Ok(ProcessResponse::Removed { session_id })
            }
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> =
            self.sessions().values().map(|session| session.summary()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn poll(&self, session_id: &str) -> Result<PollResult, ExecError> {
        Ok(self.get(session_id)?.poll())
    }

    pub fn log(
        &self,
        session_id: &str,
        offset: Option<u64>,
        limit: Option<usize>,
    ) -> Result<LogView, ExecError> {
        Ok(self.get(session_id)?.log(offset, limit))
    }

    pub async fn write(&self, session_id: &str, data: &str, eof: bool) -> Result<usize, ExecError> {
        let session = self.get(session_id)?;
        if session.state() != SessionState::Running {
            return Err(ExecError::SessionNotRunning(session_id.to_string()));
        }
        let mut stdin = session.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(ExecError::SessionNotRunning(session_id.to_string()));
        };
        pipe.write_all(data.as_bytes()).await?;
        pipe.flush().await?;
        if eof {
            *stdin = None;
        }
        session.record().last_activity_at = chrono::Utc::now();
        Ok(data.len())
    }

    /// Requests termination. Teardown completes asynchronously; callers
    /// observe `killed` through `poll` or [`Self::wait_for_terminal`].
    pub fn kill(&self, session_id: &str) -> Result<KillOutcome, ExecError> {
        let session = self.get(session_id)?;
        {
            let record = session.record();
            if record.state.is_terminal() || record.process_exited {
                return Ok(KillOutcome::AlreadyTerminal);
            }
        }
        session.cancel.cancel();
        tracing::info!(session_id = %session_id, "exec session kill requested");
        Ok(KillOutcome::Signalled)
    }

    pub fn clear(&self, session_id: &str) -> Result<(), ExecError> {
        self.get(session_id)?.clear_log();
        Ok(())
    }

    pub fn remove(&self, session_id: &str) -> Result<(), ExecError> {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get(session_id) else {
            return Err(ExecError::SessionNotFound(session_id.to_string()));
        };
        if !session.state().is_terminal() {
            return Err(ExecError::SessionNotTerminal(session_id.to_string()));
        }
        sessions.remove(session_id);
        tracing::debug!(session_id = %session_id, "exec session removed");
        Ok(())
    }

    pub async fn wait_for_terminal(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<SessionState, ExecError> {
        let session = self.get(session_id)?;
        let mut done = session.done_tx.subscribe();
        let _ = tokio::time::timeout(timeout, done.wait_for(|finished| *finished)).await;
        Ok(session.state())
    }

    /// Kills every live session started by `owner`.
    pub fn kill_owned(&self, owner: &str) -> usize {
        let owned: Vec<String> = self
            .sessions()
            .values()
            .filter(|session| session.owner.as_deref() == Some(owner))
            .map(|session| session.id.clone())
            .collect();
        owned
            .iter()
            .filter(|id| matches!(self.kill(id), Ok(KillOutcome::Signalled)))
            .count()
    }

    /// Process-wide teardown: kills everything and forgets every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ExecSession>> = self.sessions().values().cloned().collect();
        for session in &sessions {
            let _ = self.kill(&session.id);
        }
        for session in &sessions {
            let mut done = session.done_tx.subscribe();
            let _ =
                tokio::time::timeout(SHUTDOWN_GRACE, done.wait_for(|finished| *finished)).await;
        }
        self.sessions().clear();
        tracing::info!(count = sessions.len(), "exec sessions shut down");
    }

    fn get(&self, session_id: &str) -> Result<Arc<ExecSession>, ExecError> {
        self.sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ExecError::SessionNotFound(session_id.to_string()))
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<ExecSession>>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_child(&self, request: &ExecRequest) -> Result<Child, ExecError> {
        let workdir = request
            .workdir
            .clone()
            .unwrap_or_else(|| self.inner.config.workspace_root.clone());
        let mut command = Command::new(&self.inner.config.shell);
        command
            .arg("-c")
            .arg(&request.command)
            .current_dir(workdir)
            .env("TERM", "dumb")
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        command
            .spawn()
            .map_err(|error| ExecError::Spawn(format!("{}: {error}", request.command)))
    }
}

fn spawn_reader<R>(session: Arc<ExecSession>, mut stream: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => session.append_output(&buf[..n]),
            }
        }
    })
}

async fn supervise(
    session: Arc<ExecSession>,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    max_runtime: Option<Duration>,
    emitter: Arc<dyn EventEmitter>,
) {
    let pid = child.id();
    let deadline = async {
        match max_runtime {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let (status, killed) = tokio::select! {
        status = child.wait() => (status.ok(), false),
        _ = session.cancel.cancelled() => (terminate(&mut child, pid).await, true),
        _ = deadline => {
            tracing::warn!(session_id = %session.id, "exec session exceeded max runtime, killing");
            (terminate(&mut child, pid).await, true)
        }
    };
    session.mark_process_exited();

    // Background grandchildren may hold the pipes open after the shell exits.
    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }

    let exit_code = status.and_then(|status| status.code());
    *session.stdin.lock().await = None;
    let state = session.finish(exit_code, killed);

    tracing::info!(
        session_id = %session.id,
        state = %state,
        exit_code = ?exit_code,
        "exec session finished"
    );
    let kind = match state {
        SessionState::Killed => EventKind::ExecSessionKilled,
        _ => EventKind::ExecSessionExit,
    };
    let mut event = RuntimeEvent::new(kind, session.owner.as_deref())
        .with("session_id", session.id.clone());
    if let Some(code) = exit_code {
        event = event.with("exit_code", code);
    }
    emit_quiet(emitter.as_ref(), event);
}

async fn terminate(child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Err(error) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!(pid, %error, "killpg failed, falling back to direct kill");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(error) = child.start_kill() {
        tracing::debug!(%error, "start_kill failed; process may already be gone");
    }
    child.wait().await.ok()
}

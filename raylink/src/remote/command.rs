//! Remote Command Adapter
//!
//! Turns one command string into a pollable, cancellable process on a
//! session link:
//!
//! - `start` spawns it and returns a [`CommandHandle`]
//! - `CommandHandle::poll` waits up to a timeout and returns output deltas
//! - `CommandHandle::cancel` writes an interrupt byte to stdin and sends
//!   SIGINT to the remote process id, then reports what it observed
//! - `CommandHandle::join` waits for completion and returns everything
//!
//! The remote pid is learned from a marker line printed by the wrapper
//! script before the user command is exec'd; the line never reaches stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use shared_types::{CancelOutcome, CommandId};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::link::SessionLink;
use super::paths::single_quote;
use super::transport::SSH_CONNECTION_FAILURE;
use super::RemoteError;

const PID_MARKER: &str = "__RAYLINK_PID__:";

/// How long output readers may keep draining after the process exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Byte written to the command's stdin on cancel (ETX, Ctrl-C).
const INTERRUPT_BYTE: u8 = 0x03;

// ============================================================================
// Request / results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub text: String,
    /// Prepend the session's environment bootstrap prefix.
    pub prepend_prefix: bool,
}

impl CommandRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prepend_prefix: true,
        }
    }

    pub fn without_prefix(mut self) -> Self {
        self.prepend_prefix = false;
        self
    }

    fn script(&self, prefix: &str) -> String {
        let body = self.text.replace("\r\n", "\n");
        let body = body.trim_end_matches('\n');
        if self.prepend_prefix && !prefix.trim().is_empty() {
            format!("{}\n{body}", prefix.trim_end())
        } else {
            body.to_string()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub done: bool,
    pub stdout_delta: String,
    pub stderr_delta: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub remote_pid: Option<u32>,
}

// ============================================================================
// Shared state between the handle and the background tasks
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ExitRecord {
    code: Option<i32>,
    connection_lost: bool,
}

pub(crate) struct CommandShared {
    pub(crate) id: CommandId,
    stdout: Mutex<String>,
    stderr: Mutex<String>,
    remote_pid: OnceLock<u32>,
    exit: Mutex<Option<ExitRecord>>,
    done_tx: watch::Sender<bool>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    abort: CancellationToken,
    cancelled: AtomicBool,
}

impl CommandShared {
    pub(crate) fn remote_pid(&self) -> Option<u32> {
        self.remote_pid.get().copied()
    }

    /// Kill the local child process (the `ssh` client or the local shell).
    pub(crate) fn abort_local(&self) {
        self.abort.cancel();
    }

    fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    fn exit(&self) -> Option<ExitRecord> {
        *self.exit.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(buffer: &Mutex<String>, line: &str) {
        let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push_str(line);
        buffer.push('\n');
    }

    fn snapshot(buffer: &Mutex<String>, from: usize) -> (String, usize) {
        let buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
        let from = from.min(buffer.len());
        (buffer[from..].to_string(), buffer.len())
    }

    fn finish(&self, record: ExitRecord) {
        *self.exit.lock().unwrap_or_else(|e| e.into_inner()) = Some(record);
        self.done_tx.send_replace(true);
    }
}

// ============================================================================
// Start
// ============================================================================

/// Start `request` on `link`. Fails with `NotConnected` on a dead link.
pub async fn start(
    link: &Arc<SessionLink>,
    request: CommandRequest,
) -> Result<CommandHandle, RemoteError> {
    if !link.is_connected() {
        return Err(RemoteError::NotConnected);
    }

    let body = request.script(link.command_prefix());
    let wrapper = format!(
        "printf '{PID_MARKER}%s\\n' \"$$\"; exec /bin/sh -c {}",
        single_quote(&body)
    );

    let mut command = link.transport().command(&wrapper);
    command
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    let mut child = command
        .spawn()
        .map_err(|e| RemoteError::Spawn(format!("{}: {e}", link.transport().describe())))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RemoteError::Spawn("stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RemoteError::Spawn("stderr was not captured".to_string()))?;
    let stdin = child.stdin.take();

    let (done_tx, done_rx) = watch::channel(false);
    let shared = Arc::new(CommandShared {
        id: CommandId::new(),
        stdout: Mutex::new(String::new()),
        stderr: Mutex::new(String::new()),
        remote_pid: OnceLock::new(),
        exit: Mutex::new(None),
        done_tx,
        stdin: tokio::sync::Mutex::new(stdin),
        abort: CancellationToken::new(),
        cancelled: AtomicBool::new(false),
    });
    link.register(shared.clone());

    tracing::debug!(
        session = %link.key(),
        command_id = %shared.id,
        "Started remote command"
    );

    let stdout_task = tokio::spawn(pump(stdout, shared.clone(), Stream::Stdout));
    let stderr_task = tokio::spawn(pump(stderr, shared.clone(), Stream::Stderr));

    let waiter_shared = shared.clone();
    let waiter_link = link.clone();
    tokio::spawn(async move {
        let shared = waiter_shared;
        let link = waiter_link;
        let status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = shared.abort.cancelled() => {
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };

        for task in [stdout_task, stderr_task] {
            let abort = task.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
                abort.abort();
            }
        }
        shared.stdin.lock().await.take();

        let code = status.and_then(|s| s.code());
        let connection_lost = !link.is_connected()
            || (link.transport().is_ssh() && code == Some(SSH_CONNECTION_FAILURE));
        tracing::debug!(
            session = %link.key(),
            command_id = %shared.id,
            exit_code = ?code,
            connection_lost,
            "Remote command finished"
        );
        shared.finish(ExitRecord {
            code,
            connection_lost,
        });
        link.unregister(&shared.id);
    });

    Ok(CommandHandle {
        shared,
        link: link.clone(),
        done_rx,
        stdout_cursor: 0,
        stderr_cursor: 0,
    })
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn pump<R>(reader: R, shared: Arc<CommandShared>, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    let mut first = true;
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(command_id = %shared.id, error = %e, "Output stream closed with error");
                break;
            }
        }
        let text = String::from_utf8_lossy(&raw);
        let line = text.trim_end_matches('\n').trim_end_matches('\r');
        match stream {
            Stream::Stdout => {
                if first {
                    first = false;
                    if let Some(pid) = line.strip_prefix(PID_MARKER) {
                        if let Ok(pid) = pid.trim().parse::<u32>() {
                            let _ = shared.remote_pid.set(pid);
                        }
                        continue;
                    }
                }
                CommandShared::append(&shared.stdout, line);
            }
            Stream::Stderr => CommandShared::append(&shared.stderr, line),
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to one outstanding command. Owned by the worker that started it.
pub struct CommandHandle {
    shared: Arc<CommandShared>,
    link: Arc<SessionLink>,
    done_rx: watch::Receiver<bool>,
    stdout_cursor: usize,
    stderr_cursor: usize,
}

impl std::fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("id", &self.shared.id)
            .field("remote_pid", &self.shared.remote_pid())
            .field("done", &self.shared.is_done())
            .finish()
    }
}

impl CommandHandle {
    pub fn id(&self) -> &CommandId {
        &self.shared.id
    }

    pub fn remote_pid(&self) -> Option<u32> {
        self.shared.remote_pid()
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Whether the link this command runs on is still up.
    pub fn session_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Live probe of the link's control channel.
    pub async fn check_session(&self) -> bool {
        self.link.check_alive().await
    }

    /// A cloneable cancel capability for this command.
    pub fn interrupter(&self) -> CommandInterrupt {
        CommandInterrupt {
            shared: self.shared.clone(),
            link: self.link.clone(),
        }
    }

    /// Wait up to `timeout` for completion and return output produced since the last poll.
    ///
    /// A command that ended because its connection dropped yields
    /// `ConnectionLost` instead of a normal `done` report.
    pub async fn poll(&mut self, timeout: Duration) -> Result<PollReport, RemoteError> {
        let done = tokio::time::timeout(timeout, self.done_rx.wait_for(|done| *done))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        let (stdout_delta, stdout_cursor) = CommandShared::snapshot(&self.shared.stdout, self.stdout_cursor);
        let (stderr_delta, stderr_cursor) = CommandShared::snapshot(&self.shared.stderr, self.stderr_cursor);
        self.stdout_cursor = stdout_cursor;
        self.stderr_cursor = stderr_cursor;

        if done && !self.is_cancelled() {
            if let Some(exit) = self.shared.exit() {
                if exit.connection_lost {
                    return Err(RemoteError::ConnectionLost);
                }
            }
        }

        Ok(PollReport {
            done,
            stdout_delta,
            stderr_delta,
        })
    }

    /// Best-effort interrupt. Never fails; see [`CancelOutcome`].
    pub async fn cancel(&self) -> CancelOutcome {
        self.interrupter().cancel().await
    }

    /// Wait for completion and return the full output.
    pub async fn join(&mut self) -> Result<CommandOutput, RemoteError> {
        let _ = self.done_rx.wait_for(|done| *done).await;

        if self.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        let exit = self.shared.exit();
        if exit.map(|e| e.connection_lost).unwrap_or(true) {
            return Err(RemoteError::ConnectionLost);
        }

        let (stdout, _) = CommandShared::snapshot(&self.shared.stdout, 0);
        let (stderr, _) = CommandShared::snapshot(&self.shared.stderr, 0);
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: exit.and_then(|e| e.code),
            remote_pid: self.remote_pid(),
        })
    }
}

/// Cancel capability detached from the handle, so the orchestrator can
/// interrupt commands that a worker still owns.
#[derive(Clone)]
pub struct CommandInterrupt {
    shared: Arc<CommandShared>,
    link: Arc<SessionLink>,
}

impl CommandInterrupt {
    pub fn command_id(&self) -> &CommandId {
        &self.shared.id
    }

    pub async fn cancel(&self) -> CancelOutcome {
        self.shared.cancelled.store(true, Ordering::Release);

        if !self.link.is_connected() {
            return CancelOutcome::NotSent;
        }
        if self.shared.is_done() {
            return CancelOutcome::AlreadyFinished;
        }

        {
            let mut stdin = self.shared.stdin.lock().await;
            if let Some(pipe) = stdin.as_mut() {
                let _ = pipe.write_all(&[INTERRUPT_BYTE]).await;
                let _ = pipe.flush().await;
            }
        }

        match self.shared.remote_pid() {
            Some(pid) => {
                if let Err(e) = self.link.interrupt_remote(pid).await {
                    tracing::debug!(command_id = %self.shared.id, pid, error = %e, "Out-of-band interrupt failed");
                }
            }
            None => self.shared.abort_local(),
        }

        let mut done_rx = self.shared.done_tx.subscribe();
        let observed = tokio::time::timeout(
            self.link.cancel_grace(),
            done_rx.wait_for(|done| *done),
        )
        .await;

        let outcome = match observed {
            Ok(Ok(_)) => CancelOutcome::Terminated,
            _ => CancelOutcome::SignalSent,
        };
        tracing::info!(
            session = %self.link.key(),
            command_id = %self.shared.id,
            outcome = ?outcome,
            "Cancelled remote command"
        );
        outcome
    }
}

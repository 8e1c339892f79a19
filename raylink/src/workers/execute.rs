//! Execute-command worker
//!
//! Inputs: `commands` (string or list), `run` (bool or list of bools).
//! Outputs: `stdout` (one entry per command), `stderr` (lines), `ran`.
//!
//! All commands of an iteration run as one remote script; an `echo` of
//! [`JOIN_MARKER`] between them lets stdout be split back per command.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use shared_types::DiagnosticLevel;

use crate::actors::RemoteSession;
use crate::host::{read_gate, read_string_list, IterationAccess};
use crate::orchestrator::{Dispatch, NodeState, Worker, WorkerContext, WorkerError};
use crate::remote::{CommandRequest, Globals, RemoteError};

pub const JOIN_MARKER: &str = "_JOIN_";

pub const FLAG_ADD_PREFIX: &str = "add_prefix";
pub const FLAG_SUPPRESS_WARNINGS: &str = "suppress_warnings";

const CHANNEL_COMMANDS: &str = "commands";
const CHANNEL_STDOUT: &str = "stdout";
const CHANNEL_STDERR: &str = "stderr";

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub prepend_prefix: bool,
    pub suppress_warnings: bool,
    pub poll_interval: Duration,
    /// Consecutive disconnected polls tolerated before failing.
    pub connection_grace_polls: u32,
    /// Every n-th poll probes the control channel instead of trusting the flag.
    pub liveness_check_every: u32,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            prepend_prefix: true,
            suppress_warnings: false,
            poll_interval: Duration::from_millis(100),
            connection_grace_polls: 5,
            liveness_check_every: 10,
        }
    }
}

pub struct ExecuteCommandWorker {
    session: RemoteSession,
    globals: Arc<Globals>,
    options: ExecuteOptions,
    commands: Vec<String>,
    last_run: Option<Duration>,
    stdout: Option<String>,
    stderr: Option<String>,
}

impl ExecuteCommandWorker {
    pub fn new(session: RemoteSession, globals: Arc<Globals>, options: ExecuteOptions) -> Self {
        Self {
            session,
            globals,
            options,
            commands: Vec::new(),
            last_run: None,
            stdout: None,
            stderr: None,
        }
    }

    fn script(&self) -> String {
        self.commands
            .iter()
            .map(|command| command.replace("\r\n", "\n").trim_end().to_string())
            .collect::<Vec<_>>()
            .join(&format!("\necho {JOIN_MARKER}\n"))
    }
}

#[async_trait]
impl Worker for ExecuteCommandWorker {
    fn name(&self) -> &str {
        "execute"
    }

    fn duplicate(&self) -> Option<Box<dyn Worker>> {
        Some(Box::new(Self::new(
            self.session.clone(),
            self.globals.clone(),
            self.options.clone(),
        )))
    }

    fn pull_inputs(
        &mut self,
        access: &mut dyn IterationAccess,
        state: &mut NodeState,
    ) -> Result<Dispatch, WorkerError> {
        self.options.prepend_prefix = state.flag_or(FLAG_ADD_PREFIX, self.options.prepend_prefix);
        self.options.suppress_warnings =
            state.flag_or(FLAG_SUPPRESS_WARNINGS, self.options.suppress_warnings);
        self.last_run = state.last_run();

        if !read_gate(access, "run") {
            return Ok(Dispatch::Skip);
        }

        let commands = read_string_list(access, "commands");
        if commands.iter().all(|command| command.trim().is_empty()) {
            return Err(WorkerError::InvalidInput("No commands given".to_string()));
        }
        self.commands = commands;
        state.store(CHANNEL_COMMANDS, access.iteration(), Some(self.script()));
        Ok(Dispatch::Run)
    }

    async fn run(&mut self, ctx: WorkerContext) -> Result<(), WorkerError> {
        ctx.checkpoint()?;

        let substitution = self.globals.apply(&self.script());
        if !substitution.missing.is_empty() {
            tracing::debug!(iteration = ctx.iteration, missing = ?substitution.missing, "Unresolved placeholders left in command");
        }
        let request = CommandRequest {
            text: substitution.text,
            prepend_prefix: self.options.prepend_prefix,
        };

        let mut handle = self.session.start_command(request).await?;
        ctx.track(&handle);

        let started = Instant::now();
        let check_every = self.options.liveness_check_every.max(1);
        let mut polls: u32 = 0;
        let mut lost_polls: u32 = 0;

        loop {
            let report = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                report = handle.poll(self.options.poll_interval) => Some(report),
            };
            let Some(report) = report else {
                let outcome = handle.cancel().await;
                tracing::debug!(iteration = ctx.iteration, outcome = ?outcome, "Command interrupted");
                return Err(WorkerError::Cancelled);
            };
            if report?.done {
                break;
            }

            if let Some(last) = self.last_run {
                let fraction = started.elapsed().as_secs_f64() / last.as_secs_f64().max(0.001);
                ctx.progress.report(fraction.min(0.99));
            }

            polls = polls.wrapping_add(1);
            let alive = if polls % check_every == 0 {
                handle.check_session().await
            } else {
                handle.session_connected()
            };
            if alive {
                lost_polls = 0;
                continue;
            }
            lost_polls += 1;
            tracing::warn!(iteration = ctx.iteration, lost_polls, "Session not connected while command runs");
            if lost_polls > self.options.connection_grace_polls {
                let _ = handle.cancel().await;
                return Err(WorkerError::Remote(RemoteError::ConnectionLost));
            }
        }

        let output = handle.join().await?;
        self.stdout = Some(output.stdout);
        self.stderr = Some(output.stderr).filter(|stderr| !stderr.trim().is_empty());
        ctx.progress.report(1.0);
        Ok(())
    }

    fn push_outputs(&mut self, access: &mut dyn IterationAccess, state: &mut NodeState) {
        let iteration = access.iteration();
        state.store(CHANNEL_STDOUT, iteration, self.stdout.clone());
        state.store(CHANNEL_STDERR, iteration, self.stderr.clone());
        let ran = ran(self.stderr.as_deref(), self.options.suppress_warnings);
        emit(
            access,
            self.stdout.as_deref(),
            self.stderr.as_deref(),
            ran,
            self.options.suppress_warnings,
        );
    }

    fn push_cached(&mut self, access: &mut dyn IterationAccess, state: &NodeState) {
        let iteration = access.iteration();
        let stdout = state.cached(CHANNEL_STDOUT, iteration);
        let stderr = state.cached(CHANNEL_STDERR, iteration);
        if stdout.is_none() && stderr.is_none() {
            access.add_diagnostic(
                DiagnosticLevel::Remark,
                "No cached results. Set run to true to execute".to_string(),
            );
            access.set_output("ran", Value::Bool(false));
            return;
        }
        let suppress = state.flag_or(FLAG_SUPPRESS_WARNINGS, self.options.suppress_warnings);
        emit(access, stdout, stderr, false, suppress);
    }

    fn describe(&self) -> Option<String> {
        let first = self.commands.iter().find(|c| !c.trim().is_empty())?;
        let first = first.trim();
        let mut description: String = first.chars().take(80).collect();
        if first.chars().count() > 80 {
            description.push_str("...");
        }
        if self.commands.len() > 1 {
            description.push_str(&format!(" (+{} more)", self.commands.len() - 1));
        }
        Some(description)
    }
}

/// Whether a run counts as successful given its stderr.
pub fn ran(stderr: Option<&str>, suppress_warnings: bool) -> bool {
    match stderr {
        None => true,
        Some(text) => suppress_warnings || text.to_lowercase().contains("warning"),
    }
}

/// Split stdout of a joined script back into one entry per command.
pub fn split_joined(stdout: &str) -> Vec<String> {
    let mut parts = vec![Vec::new()];
    for line in stdout.lines() {
        if line.trim_end_matches('\r') == JOIN_MARKER {
            parts.push(Vec::new());
        } else if let Some(current) = parts.last_mut() {
            current.push(line);
        }
    }
    parts.into_iter().map(|lines| lines.join("\n")).collect()
}

fn emit(
    access: &mut dyn IterationAccess,
    stdout: Option<&str>,
    stderr: Option<&str>,
    ran: bool,
    suppress_warnings: bool,
) {
    let stdout_parts = stdout.map(split_joined).unwrap_or_default();
    let stderr_lines: Vec<&str> = stderr
        .map(|text| text.lines().filter(|line| !line.trim().is_empty()).collect())
        .unwrap_or_default();

    access.set_output("stdout", json!(stdout_parts));
    access.set_output("stderr", json!(stderr_lines));
    access.set_output("ran", Value::Bool(ran));

    if let Some(text) = stderr {
        if !suppress_warnings {
            let level = if text.to_lowercase().contains("error") {
                DiagnosticLevel::Error
            } else {
                DiagnosticLevel::Warning
            };
            access.add_diagnostic(level, text.trim().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_joined_keeps_empty_sections() {
        assert_eq!(split_joined("a\n_JOIN_\nb\nc\n"), vec!["a", "b\nc"]);
        assert_eq!(split_joined("_JOIN_\nb\n"), vec!["", "b"]);
        assert_eq!(split_joined("only\n"), vec!["only"]);
    }

    #[test]
    fn test_ran_rules() {
        assert!(ran(None, false));
        assert!(ran(Some("warning: deprecated"), false));
        assert!(!ran(Some("fatal: no such file"), false));
        assert!(ran(Some("fatal: no such file"), true));
    }
}

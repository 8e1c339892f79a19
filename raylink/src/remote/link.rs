//! SessionLink - one established connection
//!
//! A new link is created on every successful connect and is never reused
//! after disconnect. Command handles keep an `Arc` to the link they were
//! started on, so a handle can always tell whether *its* connection is still
//! alive, even after the session reconnected.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared_types::CommandId;

use super::command::CommandShared;
use super::paths::{join_remote, shell_quote, SessionPaths};
use super::transport::Transport;
use super::RemoteError;

/// Exit code used by the read-file probe when the path is not a regular file.
const MISSING_FILE_EXIT: i32 = 44;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SessionLink {
    key: String,
    transport: Transport,
    paths: SessionPaths,
    command_prefix: String,
    cancel_grace: Duration,
    connected: AtomicBool,
    connected_at: DateTime<Utc>,
    commands: Mutex<HashMap<CommandId, Arc<CommandShared>>>,
}

impl std::fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLink")
            .field("key", &self.key)
            .field("target", &self.transport.describe())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SessionLink {
    pub fn new(
        key: impl Into<String>,
        transport: Transport,
        paths: SessionPaths,
        command_prefix: impl Into<String>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            transport,
            paths,
            command_prefix: command_prefix.into(),
            cancel_grace,
            connected: AtomicBool::new(true),
            connected_at: Utc::now(),
            commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn command_prefix(&self) -> &str {
        &self.command_prefix
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Connected flag plus a live probe of the control channel.
    pub async fn check_alive(&self) -> bool {
        self.is_connected() && self.transport.check().await
    }

    pub fn outstanding_commands(&self) -> usize {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn register(&self, shared: Arc<CommandShared>) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(shared.id.clone(), shared);
    }

    pub(crate) fn unregister(&self, id: &CommandId) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Mark the link dead, interrupt outstanding commands and close the transport.
    ///
    /// Idempotent. Commands still running observe `ConnectionLost`.
    pub async fn shutdown(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let outstanding: Vec<Arc<CommandShared>> = self
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, shared)| shared)
            .collect();

        if !outstanding.is_empty() {
            tracing::info!(
                session = %self.key,
                count = outstanding.len(),
                "Stopping outstanding commands before disconnect"
            );
        }

        let kills = outstanding.iter().filter_map(|shared| {
            shared.remote_pid().map(|pid| {
                let script = interrupt_script(pid);
                async move {
                    let _ = self
                        .transport
                        .run_capture(&script, Some(Duration::from_secs(2)))
                        .await;
                }
            })
        });
        futures::future::join_all(kills).await;

        for shared in &outstanding {
            shared.abort_local();
        }

        self.transport.close().await;
        tracing::info!(session = %self.key, target = %self.transport.describe(), "Session link closed");
    }

    /// Send SIGINT to a remote process and its direct children.
    pub(crate) async fn interrupt_remote(&self, pid: u32) -> Result<(), RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::NotConnected);
        }
        self.transport
            .run_capture(&interrupt_script(pid), Some(Duration::from_secs(5)))
            .await
            .map(|_| ())
    }

    // ========================================================================
    // File operations
    // ========================================================================

    fn ensure_connected(&self) -> Result<(), RemoteError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RemoteError::NotConnected)
        }
    }

    /// `mkdir -p` the directory and return its resolved absolute path.
    pub async fn ensure_directory(&self, path: &str) -> Result<String, RemoteError> {
        self.ensure_connected()?;
        let quoted = shell_quote(path);
        let script = format!("mkdir -p {quoted} && cd {quoted} && pwd -P");
        let captured = self
            .transport
            .run_capture(&script, Some(CONTROL_TIMEOUT))
            .await?;
        let resolved = captured.stdout.trim();
        if !captured.success() || resolved.is_empty() {
            tracing::warn!(
                session = %self.key,
                path = %path,
                stderr = %captured.stderr.trim(),
                "Could not ensure remote directory"
            );
            return Err(RemoteError::PathNotFound(path.to_string()));
        }
        Ok(resolved.to_string())
    }

    /// Upload a local file into `remote_dir` (created if needed); returns the remote path.
    pub async fn upload(&self, local: &Path, remote_dir: &str) -> Result<String, RemoteError> {
        self.ensure_connected()?;
        match tokio::fs::metadata(local).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(RemoteError::PathNotFound(local.display().to_string())),
        }
        let resolved = self.ensure_directory(remote_dir).await?;
        self.transport.upload(local, &resolved).await?;

        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let remote_path = join_remote(&resolved, &file_name);
        tracing::debug!(session = %self.key, local = %local.display(), remote = %remote_path, "Uploaded file");
        Ok(remote_path)
    }

    pub async fn read_file(&self, remote_path: &str) -> Result<String, RemoteError> {
        self.ensure_connected()?;
        let quoted = shell_quote(remote_path);
        let script = format!("test -f {quoted} || exit {MISSING_FILE_EXIT}; cat {quoted}");
        let captured = self
            .transport
            .run_capture(&script, Some(CONTROL_TIMEOUT))
            .await?;
        match captured.code {
            Some(0) => Ok(captured.stdout),
            Some(MISSING_FILE_EXIT) => Err(RemoteError::PathNotFound(remote_path.to_string())),
            _ => Err(RemoteError::Io(format!(
                "reading {remote_path} failed: {}",
                captured.stderr.trim()
            ))),
        }
    }
}

fn interrupt_script(pid: u32) -> String {
    format!("pkill -INT -P {pid} 2>/dev/null; kill -INT {pid} 2>/dev/null; true")
}

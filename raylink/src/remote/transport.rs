//! Transports a session can run on
//!
//! `Ssh` drives the system OpenSSH client. A control master is opened on
//! connect and every later `ssh`/`scp` invocation is multiplexed over it, so
//! concurrent commands share one authenticated connection. `Local` runs
//! commands through a local shell and copies files on the local filesystem.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::RemoteError;

/// Exit status the OpenSSH client uses for its own (connection) failures.
pub const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub shell: String,
}

impl Default for LocalTarget {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    /// Directory holding the control sockets.
    pub control_dir: PathBuf,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            identity_file: None,
            control_dir: std::env::temp_dir().join("raylink-ssh"),
        }
    }

    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) if !user.is_empty() => format!("{user}@{}", self.host),
            _ => self.host.clone(),
        }
    }

    fn control_path(&self) -> PathBuf {
        self.control_dir.join("cm-%C")
    }

    /// Options shared by `ssh` and `scp`. Port flags differ, so they are added by callers.
    fn common_options(&self, connect_timeout: Option<Duration>) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path().display()),
        ];
        if let Some(timeout) = connect_timeout {
            options.push("-o".to_string());
            options.push(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }
        if let Some(identity) = &self.identity_file {
            options.push("-i".to_string());
            options.push(identity.display().to_string());
        }
        options
    }

    fn ssh(&self) -> Command {
        let mut command = Command::new("ssh");
        command
            .args(self.common_options(None))
            .arg("-p")
            .arg(self.port.to_string());
        command
    }
}

/// Output of a short control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Local(LocalTarget),
    Ssh(SshTarget),
}

impl Transport {
    pub fn local() -> Self {
        Transport::Local(LocalTarget::default())
    }

    pub fn is_ssh(&self) -> bool {
        matches!(self, Transport::Ssh(_))
    }

    /// Human readable target, e.g. `user@host:22` or `local:/bin/sh`.
    pub fn describe(&self) -> String {
        match self {
            Transport::Local(local) => format!("local:{}", local.shell),
            Transport::Ssh(ssh) => format!("{}:{}", ssh.destination(), ssh.port),
        }
    }

    /// Establish the control channel.
    pub async fn open(&self, timeout: Duration) -> Result<(), RemoteError> {
        match self {
            Transport::Local(local) => {
                let shell = Path::new(&local.shell);
                if shell.is_absolute() && tokio::fs::metadata(shell).await.is_err() {
                    return Err(RemoteError::Unreachable(format!(
                        "shell {} does not exist",
                        local.shell
                    )));
                }
                Ok(())
            }
            Transport::Ssh(ssh) => open_ssh(ssh, timeout).await,
        }
    }

    /// Tear down the control channel. Never fails.
    pub async fn close(&self) {
        let Transport::Ssh(ssh) = self else {
            return;
        };
        let mut command = ssh.ssh();
        command
            .arg("-O")
            .arg("exit")
            .arg(ssh.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(Duration::from_secs(5), command.status()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(target = %self.describe(), error = %e, "Control master exit failed"),
            Err(_) => tracing::debug!(target = %self.describe(), "Control master exit timed out"),
        }
    }

    /// Whether the control channel still answers.
    pub async fn check(&self) -> bool {
        match self {
            Transport::Local(_) => true,
            Transport::Ssh(ssh) => {
                let mut command = ssh.ssh();
                command
                    .arg("-O")
                    .arg("check")
                    .arg(ssh.destination())
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true);
                matches!(
                    tokio::time::timeout(Duration::from_secs(5), command.status()).await,
                    Ok(Ok(status)) if status.success()
                )
            }
        }
    }

    /// A command that runs `script` through the remote (or local) shell.
    pub fn command(&self, script: &str) -> Command {
        match self {
            Transport::Local(local) => {
                let mut command = Command::new(&local.shell);
                command.arg("-c").arg(script);
                command
            }
            Transport::Ssh(ssh) => {
                let mut command = ssh.ssh();
                command.arg(ssh.destination()).arg(script);
                command
            }
        }
    }

    /// Run a short control script and capture its output.
    pub async fn run_capture(
        &self,
        script: &str,
        timeout: Option<Duration>,
    ) -> Result<Captured, RemoteError> {
        let mut command = self.command(script);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| RemoteError::ConnectionLost)?,
            None => command.output().await,
        }
        .map_err(|e| RemoteError::Spawn(e.to_string()))?;

        let captured = Captured {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code(),
        };
        if self.is_ssh() && captured.code == Some(SSH_CONNECTION_FAILURE) {
            return Err(RemoteError::ConnectionLost);
        }
        Ok(captured)
    }

    /// Copy `local` into the already existing, resolved `remote_dir`.
    pub async fn upload(&self, local: &Path, remote_dir: &str) -> Result<(), RemoteError> {
        let file_name = local
            .file_name()
            .ok_or_else(|| RemoteError::PathNotFound(local.display().to_string()))?;
        match self {
            Transport::Local(_) => {
                tokio::fs::copy(local, Path::new(remote_dir).join(file_name)).await?;
                Ok(())
            }
            Transport::Ssh(ssh) => {
                let mut command = Command::new("scp");
                command
                    .args(ssh.common_options(None))
                    .arg("-q")
                    .arg("-P")
                    .arg(ssh.port.to_string())
                    .arg(local)
                    .arg(format!("{}:{}/", ssh.destination(), remote_dir))
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                let output = command
                    .output()
                    .await
                    .map_err(|e| RemoteError::Spawn(format!("scp: {e}")))?;
                if output.status.success() {
                    return Ok(());
                }
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if output.status.code() == Some(SSH_CONNECTION_FAILURE) {
                    return Err(RemoteError::ConnectionLost);
                }
                if stderr.contains("No such file") {
                    return Err(RemoteError::PathNotFound(remote_dir.to_string()));
                }
                Err(RemoteError::Io(format!("scp failed: {stderr}")))
            }
        }
    }
}

async fn open_ssh(ssh: &SshTarget, timeout: Duration) -> Result<(), RemoteError> {
    // Reachability first, so a dead host or stopped service fails fast and distinctly.
    let address = (ssh.host.as_str(), ssh.port);
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => {}
        Ok(Err(e)) => {
            return Err(RemoteError::Unreachable(format!(
                "{}:{} ({e}). Is the SSH service running?",
                ssh.host, ssh.port
            )))
        }
        Err(_) => {
            return Err(RemoteError::Unreachable(format!(
                "{}:{} did not answer within {}s",
                ssh.host,
                ssh.port,
                timeout.as_secs()
            )))
        }
    }

    tokio::fs::create_dir_all(&ssh.control_dir).await?;

    let mut command = Command::new("ssh");
    command
        .args(ssh.common_options(Some(timeout)))
        .arg("-p")
        .arg(ssh.port.to_string())
        .arg("-o")
        .arg("ControlMaster=auto")
        .arg("-o")
        .arg("ControlPersist=yes")
        .arg(ssh.destination())
        .arg("true")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout + Duration::from_secs(1), command.output())
        .await
        .map_err(|_| RemoteError::Unreachable(format!("{} timed out during login", ssh.host)))?
        .map_err(|e| RemoteError::Spawn(format!("ssh: {e}")))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("Permission denied") || stderr.contains("Authentication failed") {
        return Err(RemoteError::Authentication(stderr));
    }
    Err(RemoteError::Unreachable(stderr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        assert_eq!(Transport::local().describe(), "local:/bin/sh");
        let mut ssh = SshTarget::new("sim.example.org", 2222);
        ssh.user = Some("ray".to_string());
        assert_eq!(Transport::Ssh(ssh).describe(), "ray@sim.example.org:2222");
    }

    #[test]
    fn test_ssh_options_use_batch_mode_and_control_path() {
        let mut ssh = SshTarget::new("h", 22);
        ssh.identity_file = Some(PathBuf::from("/keys/id"));
        let options = ssh.common_options(Some(Duration::from_secs(10)));
        assert!(options.contains(&"BatchMode=yes".to_string()));
        assert!(options.contains(&"ConnectTimeout=10".to_string()));
        assert!(options.iter().any(|o| o.starts_with("ControlPath=")));
        assert!(options.contains(&"/keys/id".to_string()));
    }

    #[tokio::test]
    async fn test_local_run_capture() {
        let captured = Transport::local()
            .run_capture("echo out; echo err >&2; exit 3", None)
            .await
            .expect("local shell runs");
        assert_eq!(captured.stdout, "out\n");
        assert_eq!(captured.stderr, "err\n");
        assert_eq!(captured.code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_local_shell_is_unreachable() {
        let transport = Transport::Local(LocalTarget {
            shell: "/definitely/not/a/shell".to_string(),
        });
        let err = transport.open(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable(_)));
    }
}

//! Remote execution layer
//!
//! - `transport`: how the control and file-transfer channels are reached
//!   (OpenSSH client with a multiplexed control master, or a local shell)
//! - `link`: one live connection, shared by every command started on it
//! - `command`: the command adapter (start / poll / cancel / join)
//! - `paths`: remote/local root bookkeeping and shell quoting
//! - `globals`: `<Key>` placeholder substitution in command text

pub mod command;
pub mod globals;
pub mod link;
pub mod paths;
pub mod transport;

pub use command::{CommandHandle, CommandInterrupt, CommandOutput, CommandRequest, PollReport};
pub use globals::{Globals, Substitution};
pub use link::SessionLink;
pub use paths::{shell_quote, SessionPaths};
pub use transport::{Captured, LocalTarget, SshTarget, Transport};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Not connected. Connect the session first")]
    NotConnected,

    #[error("Remote host unreachable: {0}")]
    Unreachable(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection lost while the command was running")]
    ConnectionLost,

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Command was cancelled")]
    Cancelled,

    #[error("Failed to spawn: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        RemoteError::Io(e.to_string())
    }
}

impl RemoteError {
    /// Connection-layer failures the user can fix by (re)connecting.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RemoteError::NotConnected
                | RemoteError::Unreachable(_)
                | RemoteError::Authentication(_)
                | RemoteError::ConnectionLost
        )
    }
}

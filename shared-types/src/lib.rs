//! Shared types between the evaluation engine and its hosts
//!
//! These types are used by both:
//! - the async node orchestrator and remote session layer (native Rust)
//! - host integrations that render node status and session state
//!
//! Serializable with serde for JSON persistence and host bridges

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Stable identity of a node instance; doubles as the log correlation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a journal task entry (ULID, sortable by creation time).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogEntryId(pub String);

impl LogEntryId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LogEntryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of one outstanding remote command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CommandId(pub String);

impl CommandId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Where a node is in the two-phase request/collect protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PassPhase {
    /// No workers queued or active.
    Idle,
    /// Inputs are being pulled and tasks queued; nothing started yet.
    Dispatching { queued: usize },
    /// Tasks started; `completed` of `target` have finished.
    Running { completed: usize, target: usize },
    /// All workers finished; a collection pass has been requested.
    Ready { target: usize },
    /// Outputs are being pushed, one iteration per call.
    Collecting { remaining: usize },
}

impl PassPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, PassPhase::Idle)
    }

    /// True while the pass owns in-flight or unconsumed worker results.
    pub fn is_busy(&self) -> bool {
        !matches!(self, PassPhase::Idle | PassPhase::Dispatching { .. })
    }
}

/// Coarse visible phase of a node, used by hosts for coloring/status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    NotRunning,
    Running,
    Reusing,
    Done,
    Cancelled,
    Failed,
}

/// Severity of a per-iteration diagnostic attached to a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Remark,
    Warning,
    Error,
}

/// Visible status of a node: phase plus the message shown to the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    pub phase: NodePhase,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl NodeStatus {
    pub fn new(phase: NodePhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            updated_at: Utc::now(),
        }
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::new(NodePhase::NotRunning, "")
    }
}

/// Tri-state cancellation flag carried by every worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelState {
    NotRequested,
    Requested,
    Acknowledged,
}

impl CancelState {
    pub fn as_u8(self) -> u8 {
        match self {
            CancelState::NotRequested => 0,
            CancelState::Requested => 1,
            CancelState::Acknowledged => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => CancelState::NotRequested,
            1 => CancelState::Requested,
            _ => CancelState::Acknowledged,
        }
    }
}

// ============================================================================
// Remote
// ============================================================================

/// Connectivity of a remote session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a cancellation request against a remote command achieved.
///
/// Sending a signal and observing termination are distinct outcomes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The command had already finished before the request.
    AlreadyFinished,
    /// The session was not connected; the handle is marked cancelled only.
    NotSent,
    /// Interrupt delivered, but no exit was observed within the grace window.
    SignalSent,
    /// Interrupt delivered and the command was observed to exit.
    Terminated,
}

/// Snapshot of a session for display and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub key: String,
    pub state: ConnectionState,
    pub target: Option<String>,
    pub remote_home: Option<String>,
    pub local_home: Option<String>,
    pub upload_home: Option<String>,
    pub outstanding_commands: usize,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ============================================================================
// Journal
// ============================================================================

/// Terminal outcome recorded when a journal task finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Done,
    Cancelled,
    Failed(String),
}

impl std::fmt::Display for LogOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogOutcome::Done => write!(f, "Finished"),
            LogOutcome::Cancelled => write!(f, "Cancelled"),
            LogOutcome::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

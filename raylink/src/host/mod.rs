//! Evaluation-engine contract
//!
//! The host owns one evaluation thread and calls into a node once per
//! iteration of a pass. [`IterationAccess`] is what the node sees during such
//! a call; [`HostHandle`] is the only thing that may be touched from worker
//! threads.

use serde_json::Value;
use shared_types::DiagnosticLevel;

pub mod headless;

pub use headless::{HeadlessEngine, HeadlessHandle, HostEvent, IterationResult, Row, SettleError};

/// Per-iteration view of the host, valid only inside one evaluation call.
pub trait IterationAccess {
    fn iteration(&self) -> usize;

    fn input(&self, name: &str) -> Option<Value>;

    /// Single assignment per output and pass; later writes replace earlier ones.
    fn set_output(&mut self, name: &str, value: Value);

    fn add_diagnostic(&mut self, level: DiagnosticLevel, message: String);
}

/// Thread-safe requests back into the host. The host marshals them onto its
/// evaluation thread.
pub trait HostHandle: Send + Sync + 'static {
    /// Schedule another pass over the node.
    fn request_re_evaluation(&self);

    /// Repaint node status without re-evaluating.
    fn request_redraw(&self);
}

// ============================================================================
// Input helpers
// ============================================================================

/// A string or list of strings; other scalars are stringified, nulls dropped.
pub fn read_string_list(access: &dyn IterationAccess, name: &str) -> Vec<String> {
    match access.input(name) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter_map(value_to_string).collect(),
        Some(value) => value_to_string(&value).into_iter().collect(),
    }
}

pub fn read_string(access: &dyn IterationAccess, name: &str) -> Option<String> {
    read_string_list(access, name)
        .into_iter()
        .find(|s| !s.trim().is_empty())
}

/// Run gate: a bool or a list of bools, all of which must be true.
/// Missing or empty input means "off".
pub fn read_gate(access: &dyn IterationAccess, name: &str) -> bool {
    match access.input(name) {
        Some(Value::Bool(b)) => b,
        Some(Value::Array(items)) if !items.is_empty() => {
            items.iter().all(|item| matches!(item, Value::Bool(true)))
        }
        _ => false,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

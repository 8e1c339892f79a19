//! Worker interface
//!
//! A node holds one prototype worker. Each iteration that should run gets a
//! fresh duplicate that pulls that iteration's inputs on the host thread,
//! runs its body on the runtime, and pushes its outputs on the host thread
//! during the collection pass.

use async_trait::async_trait;

use super::cancel::{CancelSignal, CommandTracker};
use super::progress::ProgressReporter;
use super::state::NodeState;
use crate::host::IterationAccess;
use crate::remote::{CommandHandle, RemoteError};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum WorkerError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

/// What `pull_inputs` decided for this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Queue the body.
    Run,
    /// Do no work; cached results are pushed instead.
    Skip,
}

/// Everything a worker body may use off the host thread.
#[derive(Clone)]
pub struct WorkerContext {
    pub iteration: usize,
    pub cancel: CancelSignal,
    pub progress: ProgressReporter,
    pub(crate) commands: CommandTracker,
}

impl WorkerContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Make `handle` interruptible by the node's cancel.
    pub fn track(&self, handle: &CommandHandle) {
        self.commands.track(handle);
    }

    /// Shorthand that errors out if cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), WorkerError> {
        if self.is_cancelled() {
            Err(WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
pub trait Worker: Send + 'static {
    fn name(&self) -> &str;

    /// A fresh, independently owned instance with no per-iteration state.
    fn duplicate(&self) -> Option<Box<dyn Worker>>;

    /// Read this iteration's inputs. Runs on the host thread.
    fn pull_inputs(
        &mut self,
        access: &mut dyn IterationAccess,
        state: &mut NodeState,
    ) -> Result<Dispatch, WorkerError>;

    /// The body. Runs on the runtime; must watch `ctx.cancel`.
    async fn run(&mut self, ctx: WorkerContext) -> Result<(), WorkerError>;

    /// Write results. Runs on the host thread during collection.
    fn push_outputs(&mut self, access: &mut dyn IterationAccess, state: &mut NodeState);

    /// Write cached results for a skipped iteration.
    fn push_cached(&mut self, _access: &mut dyn IterationAccess, _state: &NodeState) {}

    /// Per-run description for the task journal, if the worker has one.
    fn describe(&self) -> Option<String> {
        None
    }
}

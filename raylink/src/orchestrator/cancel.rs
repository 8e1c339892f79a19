//! Cancellation handles
//!
//! The orchestrator holds a [`CancelHandle`] per worker and is the only
//! writer. Workers get a read-only [`CancelSignal`]. Remote commands a worker
//! starts are registered with the pass's [`CommandTracker`] so cancel can
//! interrupt them out of band.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use shared_types::CancelState;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::remote::{CommandHandle, CommandInterrupt};

#[derive(Debug)]
struct CancelInner {
    token: CancellationToken,
    state: AtomicU8,
}

#[derive(Debug, Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                token: CancellationToken::new(),
                state: AtomicU8::new(CancelState::NotRequested.as_u8()),
            }),
        }
    }

    /// Request cancellation. Returns false if it was already requested.
    pub fn request(&self) -> bool {
        let moved = self
            .inner
            .state
            .compare_exchange(
                CancelState::NotRequested.as_u8(),
                CancelState::Requested.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        self.inner.token.cancel();
        moved
    }

    /// Record that the worker's task exited after a request.
    pub fn acknowledge(&self) {
        let _ = self.inner.state.compare_exchange(
            CancelState::Requested.as_u8(),
            CancelState::Acknowledged.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn state(&self) -> CancelState {
        CancelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_requested(&self) -> bool {
        self.state() != CancelState::NotRequested
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            inner: self.inner.clone(),
        }
    }
}

/// Worker-side, read-only view of a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    pub fn state(&self) -> CancelState {
        CancelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }
}

/// Remote commands started during the current pass.
#[derive(Clone, Default)]
pub struct CommandTracker {
    commands: Arc<Mutex<Vec<CommandInterrupt>>>,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, handle: &CommandHandle) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle.interrupter());
    }

    pub fn len(&self) -> usize {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Fire-and-forget interrupt of every tracked command. Returns how many were signalled.
    pub fn interrupt_all(&self, runtime: &Handle) -> usize {
        let commands: Vec<CommandInterrupt> = self
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let count = commands.len();
        for command in commands {
            runtime.spawn(async move {
                let outcome = command.cancel().await;
                tracing::debug!(command_id = %command.command_id(), outcome = ?outcome, "Interrupted command");
            });
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_then_acknowledge() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        assert_eq!(signal.state(), CancelState::NotRequested);
        assert!(!signal.is_cancelled());

        assert!(handle.request());
        assert!(!handle.request());
        assert!(signal.is_cancelled());
        assert_eq!(signal.state(), CancelState::Requested);

        handle.acknowledge();
        assert_eq!(handle.state(), CancelState::Acknowledged);
    }

    #[test]
    fn test_acknowledge_without_request_is_ignored() {
        let handle = CancelHandle::new();
        handle.acknowledge();
        assert_eq!(handle.state(), CancelState::NotRequested);
    }

    #[tokio::test]
    async fn test_signal_wakes_waiters() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let waiter = tokio::spawn(async move { signal.cancelled().await });
        handle.request();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("joined");
    }
}

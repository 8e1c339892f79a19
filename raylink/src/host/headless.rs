//! HeadlessEngine - an in-process evaluation host
//!
//! Holds rows of named inputs (one row per iteration), runs passes over a
//! node on the calling thread, and receives re-evaluation and redraw requests
//! from worker threads over a channel. `settle` keeps running passes until
//! the node is idle again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use shared_types::DiagnosticLevel;

use super::{HostHandle, IterationAccess};
use crate::orchestrator::AsyncNode;

pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    ReEvaluate,
    Redraw,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SettleError {
    #[error("Node did not settle within {0:?}")]
    Timeout(Duration),
}

/// Thread-safe side of the engine; handed to nodes as their [`HostHandle`].
#[derive(Debug)]
pub struct HeadlessHandle {
    tx: Mutex<mpsc::Sender<HostEvent>>,
    re_evaluations: AtomicUsize,
    redraws: AtomicUsize,
}

impl HeadlessHandle {
    fn send(&self, event: HostEvent) {
        let _ = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(event);
    }

    pub fn re_evaluations(&self) -> usize {
        self.re_evaluations.load(Ordering::Acquire)
    }

    pub fn redraws(&self) -> usize {
        self.redraws.load(Ordering::Acquire)
    }
}

impl HostHandle for HeadlessHandle {
    fn request_re_evaluation(&self) {
        self.re_evaluations.fetch_add(1, Ordering::AcqRel);
        self.send(HostEvent::ReEvaluate);
    }

    fn request_redraw(&self) {
        self.redraws.fetch_add(1, Ordering::AcqRel);
        self.send(HostEvent::Redraw);
    }
}

/// Outputs and diagnostics of one iteration in the latest pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IterationResult {
    pub outputs: BTreeMap<String, Value>,
    pub diagnostics: Vec<(DiagnosticLevel, String)>,
}

struct HeadlessAccess<'a> {
    iteration: usize,
    row: &'a Row,
    result: &'a mut IterationResult,
}

impl IterationAccess for HeadlessAccess<'_> {
    fn iteration(&self) -> usize {
        self.iteration
    }

    fn input(&self, name: &str) -> Option<Value> {
        self.row.get(name).cloned()
    }

    fn set_output(&mut self, name: &str, value: Value) {
        self.result.outputs.insert(name.to_string(), value);
    }

    fn add_diagnostic(&mut self, level: DiagnosticLevel, message: String) {
        self.result.diagnostics.push((level, message));
    }
}

pub struct HeadlessEngine {
    rows: Vec<Row>,
    results: Vec<IterationResult>,
    handle: Arc<HeadlessHandle>,
    events: mpsc::Receiver<HostEvent>,
    passes: usize,
}

impl HeadlessEngine {
    pub fn new(rows: Vec<Row>) -> Self {
        let (tx, events) = mpsc::channel();
        let results = vec![IterationResult::default(); rows.len()];
        Self {
            rows,
            results,
            handle: Arc::new(HeadlessHandle {
                tx: Mutex::new(tx),
                re_evaluations: AtomicUsize::new(0),
                redraws: AtomicUsize::new(0),
            }),
            events,
            passes: 0,
        }
    }

    pub fn handle(&self) -> Arc<HeadlessHandle> {
        self.handle.clone()
    }

    pub fn host(&self) -> Arc<dyn HostHandle> {
        self.handle.clone()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn set_rows(&mut self, rows: Vec<Row>) {
        self.results = vec![IterationResult::default(); rows.len()];
        self.rows = rows;
    }

    /// One full pass: before hook, every iteration in order, after hook.
    pub fn run_pass(&mut self, node: &AsyncNode) {
        self.passes += 1;
        for result in &mut self.results {
            *result = IterationResult::default();
        }
        node.before_pass();
        for (iteration, (row, result)) in self.rows.iter().zip(self.results.iter_mut()).enumerate() {
            let mut access = HeadlessAccess {
                iteration,
                row,
                result,
            };
            node.solve(&mut access);
        }
        node.after_pass();
        tracing::trace!(node = %node.name(), pass = self.passes, "Pass evaluated");
    }

    /// Next event from worker threads, if one arrives within `timeout`.
    pub fn next_event(&self, timeout: Duration) -> Option<HostEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Run a pass, then keep serving re-evaluation requests until the node is idle.
    pub fn settle(&mut self, node: &AsyncNode, timeout: Duration) -> Result<usize, SettleError> {
        let deadline = Instant::now() + timeout;
        let first = self.passes;
        self.run_pass(node);
        loop {
            if node.phase().is_idle() {
                return Ok(self.passes - first);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SettleError::Timeout(timeout));
            }
            match self.events.recv_timeout(remaining) {
                Ok(HostEvent::ReEvaluate) => self.run_pass(node),
                Ok(HostEvent::Redraw) => {}
                Err(_) => return Err(SettleError::Timeout(timeout)),
            }
        }
    }

    pub fn results(&self) -> &[IterationResult] {
        &self.results
    }

    pub fn output(&self, iteration: usize, name: &str) -> Option<&Value> {
        self.results.get(iteration)?.outputs.get(name)
    }

    pub fn diagnostics(&self, iteration: usize) -> &[(DiagnosticLevel, String)] {
        self.results
            .get(iteration)
            .map(|r| r.diagnostics.as_slice())
            .unwrap_or(&[])
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn re_evaluations(&self) -> usize {
        self.handle.re_evaluations()
    }

    pub fn redraws(&self) -> usize {
        self.handle.redraws()
    }
}

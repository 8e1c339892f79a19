//! Async Orchestrator
//!
//! [`AsyncNode`] runs long, cancellable work from inside a host that
//! evaluates nodes synchronously, one iteration at a time, and may re-enter
//! at any point. Each pass goes through two phases:
//!
//! 1. Request: `solve` is called per iteration; a duplicate of the prototype
//!    worker pulls that iteration's inputs and is queued. `after_pass` starts
//!    every queued body at once on the runtime.
//! 2. Collect: the last body to finish asks the host for another pass. In it,
//!    `solve` pushes the outputs of the worker that read the same iteration.
//!    `after_pass` then clears the bookkeeping.
//!
//! Errors never escape `solve`; they become per-iteration diagnostics and the
//! visible node status.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use shared_types::{DiagnosticLevel, LogEntryId, LogOutcome, NodeId, NodePhase, NodeStatus, PassPhase};
use tokio::runtime::Handle;

use crate::host::{HostHandle, IterationAccess};
use crate::observability::LogSink;
use crate::remote::RemoteError;

pub mod cancel;
pub mod pass;
pub mod progress;
pub mod state;
pub mod worker;

pub use cancel::{CancelHandle, CancelSignal, CommandTracker};
pub use progress::{format_percent, ProgressAggregator, ProgressReporter};
pub use state::{LogSettings, NodeState, StateChunks};
pub use worker::{Dispatch, Worker, WorkerContext, WorkerError};

use pass::{PassBook, Phase, QueuedTask, Slot, SlotOutcome, Verdict};
use progress::RefreshSink;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(333);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Worker class not provided")]
    MissingWorker,

    #[error("Could not get a worker instance of {0}")]
    WorkerInstantiation(String),
}

/// Construction parameters for an [`AsyncNode`].
pub struct NodeConfig {
    pub name: String,
    pub prototype: Option<Box<dyn Worker>>,
    pub host: Arc<dyn HostHandle>,
    pub runtime: Handle,
    pub progress_interval: Duration,
    pub journal: Option<Arc<dyn LogSink>>,
}

impl NodeConfig {
    pub fn new(
        name: impl Into<String>,
        prototype: Option<Box<dyn Worker>>,
        host: Arc<dyn HostHandle>,
        runtime: Handle,
    ) -> Self {
        Self {
            name: name.into(),
            prototype,
            host,
            runtime,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            journal: None,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn LogSink>) -> Self {
        self.journal = Some(journal);
        self
    }
}

/// How a `solve` call is served, decided under the book lock.
enum SolveMode {
    Dispatch,
    Collect,
    Restart(Vec<CancelHandle>),
}

struct NodeInner {
    id: NodeId,
    name: String,
    prototype: Mutex<Option<Box<dyn Worker>>>,
    book: Mutex<PassBook>,
    state: Mutex<NodeState>,
    status: Arc<Mutex<NodeStatus>>,
    open_entry: Mutex<Option<LogEntryId>>,
    failures: AtomicUsize,
    commands: CommandTracker,
    progress: ProgressAggregator,
    host: Arc<dyn HostHandle>,
    runtime: Handle,
    journal: Option<Arc<dyn LogSink>>,
}

/// A node with an embedded async orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AsyncNode {
    inner: Arc<NodeInner>,
}

impl AsyncNode {
    pub fn new(config: NodeConfig) -> Self {
        let id = NodeId::new();
        let status = Arc::new(Mutex::new(NodeStatus::default()));

        let sink_status = status.clone();
        let sink_host = config.host.clone();
        let sink: RefreshSink = Arc::new(move |fraction| {
            {
                let mut status = lock(&sink_status);
                if status.phase == NodePhase::Running {
                    *status = NodeStatus::new(NodePhase::Running, format_percent(fraction));
                }
            }
            sink_host.request_redraw();
        });

        let state = NodeState {
            log: LogSettings {
                name: config.name.clone(),
                correlation_id: Some(id.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        Self {
            inner: Arc::new(NodeInner {
                id,
                name: config.name,
                prototype: Mutex::new(config.prototype),
                book: Mutex::new(PassBook::new()),
                state: Mutex::new(state),
                status,
                open_entry: Mutex::new(None),
                failures: AtomicUsize::new(0),
                commands: CommandTracker::new(),
                progress: ProgressAggregator::new(
                    config.progress_interval,
                    config.runtime.clone(),
                    sink,
                ),
                host: config.host,
                runtime: config.runtime,
                journal: config.journal,
            }),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn phase(&self) -> PassPhase {
        self.inner.book().snapshot()
    }

    pub fn status(&self) -> NodeStatus {
        lock(&self.inner.status).clone()
    }

    /// Iterations queued, running or waiting to be collected.
    pub fn active_workers(&self) -> usize {
        self.inner.book().active()
    }

    pub fn progress(&self) -> Option<f64> {
        self.inner.progress.current()
    }

    pub fn set_prototype(&self, prototype: Option<Box<dyn Worker>>) {
        *lock(&self.inner.prototype) = prototype;
    }

    // ========================================================================
    // Host hooks
    // ========================================================================

    /// Called by the host before the first iteration of a pass.
    pub fn before_pass(&self) {
        let mut book = self.inner.book();
        let phase = book.phase();
        match phase {
            Phase::Ready => {
                book.begin_collection();
                tracing::debug!(node = %self.inner.name, pass_id = book.pass_id(), "Collecting results");
            }
            Phase::Running => {
                let handles = book.reset();
                drop(book);
                self.inner.abandon(handles, "Restarting");
            }
            Phase::Dispatching => {
                // Queued by a pass that never finished; nothing was started.
                let handles = book.reset();
                drop(book);
                for handle in handles {
                    handle.request();
                }
            }
            Phase::Collecting => {
                drop(book);
                self.inner.finish_collection();
            }
            Phase::Idle => book.clear_verdicts(),
        }
    }

    /// The evaluation entry point, called once per iteration.
    pub fn solve(&self, access: &mut dyn IterationAccess) {
        let mode = {
            let mut book = self.inner.book();
            let phase = book.phase();
            match phase {
                Phase::Ready => {
                    book.begin_collection();
                    SolveMode::Collect
                }
                Phase::Collecting => SolveMode::Collect,
                Phase::Running => SolveMode::Restart(book.reset()),
                Phase::Idle | Phase::Dispatching => SolveMode::Dispatch,
            }
        };

        match mode {
            SolveMode::Collect => self.inner.collect(access),
            SolveMode::Dispatch => self.inner.dispatch(access),
            SolveMode::Restart(handles) => {
                self.inner.abandon(handles, "Restarting");
                self.inner.dispatch(access);
            }
        }
    }

    /// Called by the host after the last iteration of a pass.
    pub fn after_pass(&self) {
        let mut book = self.inner.book();
        let phase = book.phase();
        match phase {
            Phase::Dispatching => {
                let tasks = book.start();
                let pass_id = book.pass_id();
                if tasks.is_empty() {
                    book.reset();
                    return;
                }
                drop(book);
                self.inner.start_tasks(pass_id, tasks);
            }
            Phase::Collecting => {
                if book.has_slots() {
                    tracing::warn!(
                        node = %self.inner.name,
                        remaining = book.active(),
                        "Collection pass ended before every iteration was collected"
                    );
                }
                drop(book);
                self.inner.finish_collection();
            }
            Phase::Idle => book.clear_verdicts(),
            Phase::Running | Phase::Ready => {}
        }
    }

    /// Cancel everything in flight. Does not wait for workers to stop.
    pub fn request_cancellation(&self) {
        let handles = self.inner.book().reset();
        let workers = handles.len();
        for handle in &handles {
            handle.request();
        }
        let interrupted = self.inner.commands.interrupt_all(&self.inner.runtime);
        self.inner.progress.clear();
        self.inner.failures.store(0, Ordering::Release);
        self.inner.finish_journal(LogOutcome::Cancelled);
        self.inner.set_status(NodePhase::Cancelled, "Cancelled");
        self.inner.host.request_redraw();
        tracing::info!(
            node = %self.inner.name,
            workers,
            interrupted_commands = interrupted,
            "Cancelled"
        );
    }

    // ========================================================================
    // Persisted state
    // ========================================================================

    pub fn save_state(&self) -> StateChunks {
        self.inner.state().to_chunks()
    }

    pub fn load_state(&self, chunks: &StateChunks) {
        let mut loaded = NodeState::from_chunks(chunks);
        if loaded.log.correlation_id.is_none() {
            loaded.log.correlation_id = Some(self.inner.id.to_string());
        }
        *self.inner.state() = loaded;
    }

    pub fn state(&self) -> NodeState {
        self.inner.state().clone()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        let mut state = self.inner.state();
        f(&mut state)
    }

    pub fn clear_cached_data(&self) {
        self.inner.state().clear_cache();
    }
}

impl NodeInner {
    fn book(&self) -> MutexGuard<'_, PassBook> {
        lock(&self.book)
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        lock(&self.state)
    }

    fn set_status(&self, phase: NodePhase, message: impl Into<String>) {
        *lock(&self.status) = NodeStatus::new(phase, message);
    }

    fn instantiate(&self) -> Result<Box<dyn Worker>, OrchestratorError> {
        let prototype = lock(&self.prototype);
        let prototype = prototype.as_ref().ok_or(OrchestratorError::MissingWorker)?;
        prototype
            .duplicate()
            .ok_or_else(|| OrchestratorError::WorkerInstantiation(prototype.name().to_string()))
    }

    fn dispatch(&self, access: &mut dyn IterationAccess) {
        let iteration = access.iteration();
        let mut worker = match self.instantiate() {
            Ok(worker) => worker,
            Err(e) => {
                tracing::warn!(node = %self.name, iteration, error = %e, "No worker for iteration");
                self.reject(access, e.to_string());
                return;
            }
        };

        let decision = {
            let mut state = self.state();
            worker.pull_inputs(access, &mut state)
        };
        match decision {
            Err(e) => {
                tracing::debug!(node = %self.name, iteration, error = %e, "Inputs rejected");
                self.reject(access, e.to_string());
                return;
            }
            Ok(Dispatch::Skip) => {
                self.record(iteration, Verdict::Skipped);
                let state = self.state();
                worker.push_cached(access, &state);
                let message = match state.last_run() {
                    Some(last) => format!("Reusing cached result (last was {})", format_duration(last)),
                    None => "Reusing cached result".to_string(),
                };
                drop(state);
                self.set_status(NodePhase::Reusing, message);
                return;
            }
            Ok(Dispatch::Run) => {}
        }

        if let Some(description) = worker.describe() {
            self.state().log.description_dynamic = description;
        }

        let replaced = {
            let mut book = self.book();
            book.begin_dispatch();
            book.queue(iteration, worker, CancelHandle::new())
        };
        if let Some(previous) = replaced {
            previous.request();
        }
        tracing::debug!(node = %self.name, iteration, "Queued worker");
        self.set_status(NodePhase::Running, "Queued");
    }

    fn reject(&self, access: &mut dyn IterationAccess, message: String) {
        self.record(access.iteration(), Verdict::Rejected(message.clone()));
        access.add_diagnostic(DiagnosticLevel::Error, message);
    }

    fn record(&self, iteration: usize, verdict: Verdict) {
        let replaced = self.book().record(iteration, verdict);
        if let Some(previous) = replaced {
            previous.request();
        }
    }

    fn start_tasks(self: &Arc<Self>, pass_id: u64, tasks: Vec<QueuedTask>) {
        let count = tasks.len();
        self.progress.reset(count);
        self.commands.clear();
        self.failures.store(0, Ordering::Release);
        self.open_journal();
        self.set_status(NodePhase::Running, "Running");
        tracing::info!(node = %self.name, pass_id, workers = count, "Starting workers");

        // Build every context first so the spawns happen back to back.
        let prepared: Vec<(QueuedTask, WorkerContext)> = tasks
            .into_iter()
            .map(|task| {
                let ctx = WorkerContext {
                    iteration: task.iteration,
                    cancel: task.cancel.signal(),
                    progress: self.progress.reporter(task.iteration),
                    commands: self.commands.clone(),
                };
                (task, ctx)
            })
            .collect();

        for (task, ctx) in prepared {
            self.runtime.spawn(run_task(self.clone(), pass_id, task, ctx));
        }
    }

    fn collect(&self, access: &mut dyn IterationAccess) {
        let iteration = access.iteration();
        let slot = self.book().take_slot(iteration);
        match slot {
            Some(Slot {
                worker: Some(mut worker),
                outcome: SlotOutcome::Finished,
                ..
            }) => {
                let mut state = self.state();
                worker.push_outputs(access, &mut state);
            }
            Some(Slot {
                outcome: SlotOutcome::Failed(message),
                ..
            }) => {
                self.failures.fetch_add(1, Ordering::AcqRel);
                access.add_diagnostic(DiagnosticLevel::Error, message);
            }
            Some(Slot {
                outcome: SlotOutcome::Cancelled,
                ..
            }) => {
                access.add_diagnostic(DiagnosticLevel::Remark, "Cancelled".to_string());
            }
            Some(_) => {
                access.add_diagnostic(
                    DiagnosticLevel::Warning,
                    "No result was produced for this iteration".to_string(),
                );
            }
            None => {
                let verdict = self.book().take_verdict(iteration);
                match verdict {
                    Some(Verdict::Skipped) => {
                        if let Ok(mut worker) = self.instantiate() {
                            let state = self.state();
                            worker.push_cached(access, &state);
                        }
                    }
                    Some(Verdict::Rejected(message)) => {
                        access.add_diagnostic(DiagnosticLevel::Error, message);
                    }
                    None => {
                        access.add_diagnostic(
                            DiagnosticLevel::Warning,
                            "Iteration was not part of the running pass".to_string(),
                        );
                    }
                }
            }
        }
        tracing::debug!(node = %self.name, iteration, "Collected iteration");
    }

    fn finish_collection(&self) {
        let (run_time, pass_id) = {
            let mut book = self.book();
            let run_time = book.run_time();
            let pass_id = book.pass_id();
            book.reset();
            (run_time, pass_id)
        };
        self.progress.clear();
        self.commands.clear();

        let previous = {
            let mut state = self.state();
            let previous = state.last_run();
            if let Some(run_time) = run_time {
                state.last_run_ms = Some(run_time.as_millis() as u64);
            }
            previous
        };

        let mut message = match run_time {
            Some(run_time) => format!("Ran in {}", format_duration(run_time)),
            None => "Done".to_string(),
        };
        if let Some(previous) = previous {
            message.push_str(&format!(" (last was {})", format_duration(previous)));
        }

        let failures = self.failures.swap(0, Ordering::AcqRel);
        if failures > 0 {
            self.finish_journal(LogOutcome::Failed(format!("{failures} worker(s) failed")));
            self.set_status(NodePhase::Failed, format!("{failures} failed. {message}"));
        } else {
            self.finish_journal(LogOutcome::Done);
            self.set_status(NodePhase::Done, message);
        }
        tracing::info!(node = %self.name, pass_id, failures, "Pass complete");
    }

    /// Drop the current pass without collecting it.
    fn abandon(&self, handles: Vec<CancelHandle>, reason: &str) {
        for handle in &handles {
            handle.request();
        }
        self.commands.interrupt_all(&self.runtime);
        self.progress.clear();
        self.failures.store(0, Ordering::Release);
        self.finish_journal(LogOutcome::Cancelled);
        tracing::info!(node = %self.name, workers = handles.len(), reason, "Abandoned running pass");
    }

    fn on_all_done(&self, pass_id: u64) {
        self.set_status(NodePhase::Running, "Collecting results");
        tracing::debug!(node = %self.name, pass_id, "All workers finished");
        self.host.request_re_evaluation();
    }

    // ========================================================================
    // Journal
    // ========================================================================

    fn open_journal(&self) {
        let Some(journal) = &self.journal else {
            return;
        };
        let (save, name, description, correlation) = {
            let state = self.state();
            (
                state.log.save,
                if state.log.name.is_empty() {
                    self.name.clone()
                } else {
                    state.log.name.clone()
                },
                state.log.description().to_string(),
                state
                    .log
                    .correlation_id
                    .clone()
                    .unwrap_or_else(|| self.id.to_string()),
            )
        };
        if !save {
            return;
        }
        let entry = journal.add_task_start(&name, &description, &correlation);
        if let Some(stale) = lock(&self.open_entry).replace(entry) {
            journal.finish_task(&stale, LogOutcome::Cancelled);
        }
    }

    fn finish_journal(&self, outcome: LogOutcome) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Some(entry) = lock(&self.open_entry).take() {
            journal.finish_task(&entry, outcome);
        }
    }
}

async fn run_task(inner: Arc<NodeInner>, pass_id: u64, task: QueuedTask, ctx: WorkerContext) {
    let QueuedTask {
        iteration,
        mut worker,
        cancel,
    } = task;

    let result = AssertUnwindSafe(worker.run(ctx)).catch_unwind().await;
    let (worker, outcome) = match result {
        Ok(Ok(())) if cancel.is_requested() => (Some(worker), SlotOutcome::Cancelled),
        Ok(Ok(())) => (Some(worker), SlotOutcome::Finished),
        Ok(Err(WorkerError::Cancelled)) | Ok(Err(WorkerError::Remote(RemoteError::Cancelled))) => {
            (Some(worker), SlotOutcome::Cancelled)
        }
        Ok(Err(e)) => {
            tracing::warn!(node = %inner.name, pass_id, iteration, error = %e, "Worker failed");
            (Some(worker), SlotOutcome::Failed(e.to_string()))
        }
        Err(_) => {
            tracing::error!(node = %inner.name, pass_id, iteration, "Worker panicked");
            (None, SlotOutcome::Failed("Worker panicked".to_string()))
        }
    };

    if cancel.is_requested() {
        cancel.acknowledge();
    }

    let all_done = inner.book().complete(pass_id, iteration, worker, outcome);
    if all_done {
        inner.on_all_done(pass_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Short human form: `850 ms`, `12.3 s`, `4 min 05 s`.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{millis} ms");
    }
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        return format!("{secs:.1} s");
    }
    let total = duration.as_secs();
    if total < 3600 {
        return format!("{} min {:02} s", total / 60, total % 60);
    }
    format!("{} h {:02} min", total / 3600, (total % 3600) / 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850 ms");
        assert_eq!(format_duration(Duration::from_millis(12_340)), "12.3 s");
        assert_eq!(format_duration(Duration::from_secs(245)), "4 min 05 s");
        assert_eq!(format_duration(Duration::from_secs(7_260)), "2 h 01 min");
    }
}

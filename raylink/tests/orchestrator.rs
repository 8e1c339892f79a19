//! Two-phase pass scenarios driven through the headless engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use raylink::host::{read_gate, HeadlessEngine, HostEvent, IterationAccess, Row};
use raylink::observability::TaskJournal;
use raylink::orchestrator::{
    AsyncNode, Dispatch, NodeConfig, NodeState, Worker, WorkerContext, WorkerError,
};
use serde_json::{json, Value};
use shared_types::{DiagnosticLevel, LogOutcome, NodePhase, PassPhase};
use tokio::runtime::Runtime;

const SETTLE: Duration = Duration::from_secs(10);

struct SleepWorker {
    runs: Arc<AtomicUsize>,
    value: Value,
    delay: Duration,
    fail: bool,
    panic: bool,
}

impl SleepWorker {
    fn new(runs: Arc<AtomicUsize>) -> Self {
        Self {
            runs,
            value: Value::Null,
            delay: Duration::ZERO,
            fail: false,
            panic: false,
        }
    }
}

#[async_trait]
impl Worker for SleepWorker {
    fn name(&self) -> &str {
        "sleep"
    }

    fn duplicate(&self) -> Option<Box<dyn Worker>> {
        Some(Box::new(SleepWorker::new(self.runs.clone())))
    }

    fn pull_inputs(
        &mut self,
        access: &mut dyn IterationAccess,
        _state: &mut NodeState,
    ) -> Result<Dispatch, WorkerError> {
        if !read_gate(access, "run") {
            return Ok(Dispatch::Skip);
        }
        if let Some(reason) = access.input("reject").and_then(|v| v.as_str().map(str::to_string)) {
            return Err(WorkerError::InvalidInput(reason));
        }
        self.value = access.input("value").unwrap_or(Value::Null);
        self.delay = Duration::from_millis(
            access
                .input("delay_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        );
        self.fail = access.input("fail").and_then(|v| v.as_bool()).unwrap_or(false);
        self.panic = access.input("panic").and_then(|v| v.as_bool()).unwrap_or(false);
        Ok(Dispatch::Run)
    }

    async fn run(&mut self, ctx: WorkerContext) -> Result<(), WorkerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(WorkerError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }
        if self.panic {
            panic!("worker blew up");
        }
        if self.fail {
            return Err(WorkerError::Failed("boom".to_string()));
        }
        ctx.progress.report(1.0);
        Ok(())
    }

    fn push_outputs(&mut self, access: &mut dyn IterationAccess, state: &mut NodeState) {
        state.store("value", access.iteration(), Some(self.value.to_string()));
        access.set_output("value", self.value.clone());
    }

    fn push_cached(&mut self, access: &mut dyn IterationAccess, state: &NodeState) {
        if let Some(text) = state.cached("value", access.iteration()) {
            if let Ok(value) = serde_json::from_str::<Value>(text) {
                access.set_output("value", value);
            }
        }
    }
}

/// A worker that cannot be copied per iteration.
struct SingletonWorker;

#[async_trait]
impl Worker for SingletonWorker {
    fn name(&self) -> &str {
        "singleton"
    }

    fn duplicate(&self) -> Option<Box<dyn Worker>> {
        None
    }

    fn pull_inputs(
        &mut self,
        _access: &mut dyn IterationAccess,
        _state: &mut NodeState,
    ) -> Result<Dispatch, WorkerError> {
        Ok(Dispatch::Run)
    }

    async fn run(&mut self, _ctx: WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    fn push_outputs(&mut self, _access: &mut dyn IterationAccess, _state: &mut NodeState) {}
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("runtime")
}

fn row(value: Value, delay_ms: u64, run: bool) -> Row {
    let mut row = Row::new();
    row.insert("value".to_string(), value);
    row.insert("delay_ms".to_string(), json!(delay_ms));
    row.insert("run".to_string(), json!(run));
    row
}

fn node_for(engine: &HeadlessEngine, runtime: &Runtime, runs: &Arc<AtomicUsize>) -> AsyncNode {
    AsyncNode::new(NodeConfig::new(
        "sleepers",
        Some(Box::new(SleepWorker::new(runs.clone()))),
        engine.host(),
        runtime.handle().clone(),
    ))
}

#[test]
fn test_three_workers_collect_in_one_extra_pass() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut engine = HeadlessEngine::new(vec![
        row(json!("a"), 10, true),
        row(json!("b"), 20, true),
        row(json!("c"), 30, true),
    ]);
    let node = node_for(&engine, &rt, &runs);

    let started = Instant::now();
    let passes = engine.settle(&node, SETTLE).expect("settles");

    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(passes, 2);
    assert_eq!(engine.re_evaluations(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(engine.output(0, "value"), Some(&json!("a")));
    assert_eq!(engine.output(1, "value"), Some(&json!("b")));
    assert_eq!(engine.output(2, "value"), Some(&json!("c")));

    assert_eq!(node.phase(), PassPhase::Idle);
    assert_eq!(node.active_workers(), 0);
    let status = node.status();
    assert_eq!(status.phase, NodePhase::Done);
    assert!(status.message.starts_with("Ran in"), "{}", status.message);
    assert!(node.state().last_run().is_some());
}

#[test]
fn test_cancel_clears_bookkeeping_without_re_evaluation() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut engine = HeadlessEngine::new(vec![
        row(json!(1), 5_000, true),
        row(json!(2), 5_000, true),
    ]);
    let node = node_for(&engine, &rt, &runs);

    engine.run_pass(&node);
    assert!(node.phase().is_busy());
    assert_eq!(node.active_workers(), 2);

    node.request_cancellation();
    assert_eq!(node.phase(), PassPhase::Idle);
    assert_eq!(node.active_workers(), 0);
    let status = node.status();
    assert_eq!(status.phase, NodePhase::Cancelled);
    assert_eq!(status.message, "Cancelled");

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(engine.re_evaluations(), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_solve_with_run_off_starts_nothing() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut engine = HeadlessEngine::new(vec![row(json!("x"), 0, false)]);
    let node = node_for(&engine, &rt, &runs);

    let passes = engine.settle(&node, SETTLE).expect("settles");

    assert_eq!(passes, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(node.phase(), PassPhase::Idle);
    assert_eq!(node.status().phase, NodePhase::Reusing);
    assert_eq!(engine.output(0, "value"), None);
}

#[test]
fn test_failed_worker_does_not_affect_siblings() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut failing = row(json!("bad"), 5, true);
    failing.insert("fail".to_string(), json!(true));
    let mut engine = HeadlessEngine::new(vec![
        row(json!("ok-1"), 10, true),
        failing,
        row(json!("ok-2"), 20, true),
    ]);
    let node = node_for(&engine, &rt, &runs);

    engine.settle(&node, SETTLE).expect("settles");

    assert_eq!(engine.output(0, "value"), Some(&json!("ok-1")));
    assert_eq!(engine.output(1, "value"), None);
    assert_eq!(engine.output(2, "value"), Some(&json!("ok-2")));
    assert!(engine
        .diagnostics(1)
        .iter()
        .any(|(level, message)| *level == DiagnosticLevel::Error && message == "boom"));
    assert!(engine.diagnostics(0).is_empty());

    let status = node.status();
    assert_eq!(status.phase, NodePhase::Failed);
    assert!(status.message.starts_with("1 failed."), "{}", status.message);
}

#[test]
fn test_panicking_worker_is_reported_as_failure() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut panicking = row(json!("p"), 0, true);
    panicking.insert("panic".to_string(), json!(true));
    let mut engine = HeadlessEngine::new(vec![panicking, row(json!("fine"), 5, true)]);
    let node = node_for(&engine, &rt, &runs);

    engine.settle(&node, SETTLE).expect("settles");

    assert!(engine
        .diagnostics(0)
        .iter()
        .any(|(level, message)| *level == DiagnosticLevel::Error && message == "Worker panicked"));
    assert_eq!(engine.output(1, "value"), Some(&json!("fine")));
}

#[test]
fn test_re_entry_while_running_restarts_the_pass() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut engine = HeadlessEngine::new(vec![
        row(json!("r0"), 200, true),
        row(json!("r1"), 200, true),
    ]);
    let node = node_for(&engine, &rt, &runs);

    engine.run_pass(&node);
    engine.run_pass(&node);
    assert!(node.phase().is_busy());

    let deadline = Instant::now() + SETTLE;
    while !node.phase().is_idle() && Instant::now() < deadline {
        if let Some(HostEvent::ReEvaluate) = engine.next_event(Duration::from_millis(100)) {
            engine.run_pass(&node);
        }
    }

    assert!(node.phase().is_idle());
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(engine.re_evaluations(), 1);
    assert_eq!(engine.output(1, "value"), Some(&json!("r1")));
}

#[test]
fn test_saved_state_is_reused_when_run_is_off() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut engine = HeadlessEngine::new(vec![
        row(json!({"k": 1}), 5, true),
        row(json!([1, 2]), 5, true),
    ]);
    let node = node_for(&engine, &rt, &runs);
    engine.settle(&node, SETTLE).expect("first run settles");
    let chunks = node.save_state();

    let fresh_runs = Arc::new(AtomicUsize::new(0));
    let mut reload = HeadlessEngine::new(vec![
        row(json!(null), 0, false),
        row(json!(null), 0, false),
    ]);
    let restored = node_for(&reload, &rt, &fresh_runs);
    restored.load_state(&chunks);
    reload.settle(&restored, SETTLE).expect("reuse settles");

    assert_eq!(fresh_runs.load(Ordering::SeqCst), 0);
    assert_eq!(reload.output(0, "value"), Some(&json!({"k": 1})));
    assert_eq!(reload.output(1, "value"), Some(&json!([1, 2])));
    let status = restored.status();
    assert_eq!(status.phase, NodePhase::Reusing);
    assert!(
        status.message.starts_with("Reusing cached result (last was"),
        "{}",
        status.message
    );
}

#[test]
fn test_journal_records_finished_run() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let journal = Arc::new(TaskJournal::default());
    let mut engine = HeadlessEngine::new(vec![row(json!("j"), 5, true)]);
    let node = AsyncNode::new(
        NodeConfig::new(
            "journaled",
            Some(Box::new(SleepWorker::new(runs.clone()))),
            engine.host(),
            rt.handle().clone(),
        )
        .with_journal(journal.clone()),
    );
    node.with_state(|state| state.log.save = true);

    engine.settle(&node, SETTLE).expect("settles");

    assert!(journal.open_tasks(None).is_empty());
    let latest = journal.latest(10, None);
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].name, "journaled");
    assert_eq!(latest[0].correlation_id, node.id().to_string());
    assert_eq!(latest[0].outcome, Some(LogOutcome::Done));
}

#[test]
fn test_rejected_iteration_does_not_replay_previous_output() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut engine = HeadlessEngine::new(vec![
        row(json!("old0"), 5, true),
        row(json!("old1"), 5, true),
    ]);
    let node = node_for(&engine, &rt, &runs);
    engine.settle(&node, SETTLE).expect("first run settles");
    assert_eq!(engine.output(0, "value"), Some(&json!("old0")));

    let mut rejected = row(json!("new0"), 5, true);
    rejected.insert("reject".to_string(), json!("scene is empty"));
    engine.set_rows(vec![rejected, row(json!("new1"), 5, true)]);
    let passes = engine.settle(&node, SETTLE).expect("second run settles");

    assert_eq!(passes, 2);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(engine.output(0, "value"), None);
    assert!(engine.diagnostics(0).iter().any(|(level, message)| {
        *level == DiagnosticLevel::Error && message == "Invalid input: scene is empty"
    }));
    assert_eq!(engine.output(1, "value"), Some(&json!("new1")));
    assert!(engine.diagnostics(1).is_empty());
    assert_eq!(node.phase(), PassPhase::Idle);
}

#[test]
fn test_node_without_worker_reports_error_and_stays_idle() {
    let rt = runtime();
    let mut engine = HeadlessEngine::new(vec![row(json!("x"), 0, true), row(json!("y"), 0, true)]);
    let node = AsyncNode::new(NodeConfig::new(
        "empty",
        None,
        engine.host(),
        rt.handle().clone(),
    ));

    engine.run_pass(&node);

    assert_eq!(node.phase(), PassPhase::Idle);
    assert_eq!(node.active_workers(), 0);
    for iteration in 0..2 {
        assert_eq!(engine.output(iteration, "value"), None);
        assert!(engine.diagnostics(iteration).iter().any(|(level, message)| {
            *level == DiagnosticLevel::Error && message == "Worker class not provided"
        }));
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.re_evaluations(), 0);
}

#[test]
fn test_worker_that_cannot_be_duplicated_reports_error() {
    let rt = runtime();
    let mut engine = HeadlessEngine::new(vec![row(json!("x"), 0, true)]);
    let node = AsyncNode::new(NodeConfig::new(
        "singleton",
        Some(Box::new(SingletonWorker)),
        engine.host(),
        rt.handle().clone(),
    ));

    engine.run_pass(&node);

    assert_eq!(node.phase(), PassPhase::Idle);
    assert_eq!(node.active_workers(), 0);
    assert!(engine.diagnostics(0).iter().any(|(level, message)| {
        *level == DiagnosticLevel::Error && message == "Could not get a worker instance of singleton"
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.re_evaluations(), 0);
}

//! PassBook - the bookkeeping of one evaluation pass
//!
//! Lives behind the node's single lock. Every transition goes through one
//! method here, so the completion race is settled by `complete` alone: the
//! call that brings `completed` up to `target` is the only one that returns
//! `true`, and completions tagged with an older pass id are discarded.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use shared_types::PassPhase;

use super::cancel::CancelHandle;
use super::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Dispatching,
    Running,
    Ready,
    Collecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlotOutcome {
    Pending,
    Finished,
    Failed(String),
    Cancelled,
}

pub(crate) struct Slot {
    pub cancel: CancelHandle,
    pub worker: Option<Box<dyn Worker>>,
    pub outcome: SlotOutcome,
}

/// Why an iteration has no slot in the current pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// The worker asked to skip; cached results are replayed.
    Skipped,
    /// Inputs were rejected or no worker could be made; nothing is output.
    Rejected(String),
}

/// A worker whose body has not been started yet.
pub(crate) struct QueuedTask {
    pub iteration: usize,
    pub worker: Box<dyn Worker>,
    pub cancel: CancelHandle,
}

pub(crate) struct PassBook {
    pass_id: u64,
    phase: Phase,
    target: usize,
    completed: usize,
    queued: Vec<QueuedTask>,
    slots: BTreeMap<usize, Slot>,
    verdicts: BTreeMap<usize, Verdict>,
    started_at: Option<Instant>,
    run_time: Option<Duration>,
}

impl PassBook {
    pub fn new() -> Self {
        Self {
            pass_id: 0,
            phase: Phase::Idle,
            target: 0,
            completed: 0,
            queued: Vec::new(),
            slots: BTreeMap::new(),
            verdicts: BTreeMap::new(),
            started_at: None,
            run_time: None,
        }
    }

    pub fn pass_id(&self) -> u64 {
        self.pass_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn snapshot(&self) -> PassPhase {
        match self.phase {
            Phase::Idle => PassPhase::Idle,
            Phase::Dispatching => PassPhase::Dispatching {
                queued: self.queued.len(),
            },
            Phase::Running => PassPhase::Running {
                completed: self.completed,
                target: self.target,
            },
            Phase::Ready => PassPhase::Ready {
                target: self.target,
            },
            Phase::Collecting => PassPhase::Collecting {
                remaining: self.slots.len(),
            },
        }
    }

    /// Workers queued, running or awaiting collection.
    pub fn active(&self) -> usize {
        self.slots.len()
    }

    pub fn run_time(&self) -> Option<Duration> {
        self.run_time
    }

    pub fn begin_dispatch(&mut self) {
        if self.phase == Phase::Idle {
            self.phase = Phase::Dispatching;
        }
    }

    /// Record a worker for `iteration`. A second worker for the same
    /// iteration replaces the first, whose handle is returned for cancelling.
    pub fn queue(
        &mut self,
        iteration: usize,
        worker: Box<dyn Worker>,
        cancel: CancelHandle,
    ) -> Option<CancelHandle> {
        let replaced = self.slots.insert(
            iteration,
            Slot {
                cancel: cancel.clone(),
                worker: None,
                outcome: SlotOutcome::Pending,
            },
        );
        self.verdicts.remove(&iteration);
        self.queued.retain(|task| task.iteration != iteration);
        self.queued.push(QueuedTask {
            iteration,
            worker,
            cancel,
        });
        replaced.map(|slot| slot.cancel)
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Dispatching -> Running. Hands out every queued task, in iteration order.
    pub fn start(&mut self) -> Vec<QueuedTask> {
        if self.phase != Phase::Dispatching || self.queued.is_empty() {
            return Vec::new();
        }
        let mut tasks = std::mem::take(&mut self.queued);
        tasks.sort_by_key(|task| task.iteration);
        self.phase = Phase::Running;
        self.target = tasks.len();
        self.completed = 0;
        self.started_at = Some(Instant::now());
        self.run_time = None;
        tasks
    }

    /// Count one finished task. Returns `true` exactly once per pass: for the
    /// completion that makes every task done.
    pub fn complete(
        &mut self,
        pass_id: u64,
        iteration: usize,
        worker: Option<Box<dyn Worker>>,
        outcome: SlotOutcome,
    ) -> bool {
        if pass_id != self.pass_id || self.phase != Phase::Running {
            return false;
        }
        if let Some(slot) = self.slots.get_mut(&iteration) {
            slot.worker = worker;
            slot.outcome = outcome;
        }
        self.completed += 1;
        if self.completed < self.target {
            return false;
        }
        self.phase = Phase::Ready;
        self.run_time = self.started_at.map(|started| started.elapsed());
        true
    }

    /// Ready -> Collecting.
    pub fn begin_collection(&mut self) -> bool {
        if self.phase != Phase::Ready {
            return false;
        }
        self.phase = Phase::Collecting;
        true
    }

    pub fn take_slot(&mut self, iteration: usize) -> Option<Slot> {
        self.slots.remove(&iteration)
    }

    /// Record that `iteration` was dispatched without queuing a worker.
    /// A slot queued earlier for it is dropped and its handle returned.
    pub fn record(&mut self, iteration: usize, verdict: Verdict) -> Option<CancelHandle> {
        self.verdicts.insert(iteration, verdict);
        self.queued.retain(|task| task.iteration != iteration);
        self.slots.remove(&iteration).map(|slot| slot.cancel)
    }

    pub fn take_verdict(&mut self, iteration: usize) -> Option<Verdict> {
        self.verdicts.remove(&iteration)
    }

    /// Forget verdicts of a pass that queued nothing.
    pub fn clear_verdicts(&mut self) {
        self.verdicts.clear();
    }

    pub fn has_slots(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Back to Idle under a new pass id. Returns every outstanding cancel handle.
    pub fn reset(&mut self) -> Vec<CancelHandle> {
        let mut handles: Vec<CancelHandle> = self
            .slots
            .values()
            .map(|slot| slot.cancel.clone())
            .collect();
        handles.extend(self.queued.iter().map(|task| task.cancel.clone()));
        self.pass_id = self.pass_id.wrapping_add(1);
        self.phase = Phase::Idle;
        self.target = 0;
        self.completed = 0;
        self.queued.clear();
        self.slots.clear();
        self.verdicts.clear();
        self.started_at = None;
        handles
    }
}

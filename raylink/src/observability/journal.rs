//! Task Journal
//!
//! Nodes open a task entry when a pass starts running and finish it exactly
//! once with `Done`, `Cancelled` or `Failed`.
//!
//! # Retention
//!
//! - open tasks: unbounded (one per running node)
//! - finished tasks: the most recent `capacity` entries

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{LogEntryId, LogOutcome};

pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// Where nodes record the start and end of their runs.
pub trait LogSink: Send + Sync + 'static {
    fn add_task_start(&self, name: &str, description: &str, correlation_id: &str) -> LogEntryId;

    fn finish_task(&self, id: &LogEntryId, outcome: LogOutcome);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: LogEntryId,
    pub name: String,
    pub description: String,
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<LogOutcome>,
}

impl JournalEntry {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// One display line, e.g. `[2024-05-01 10:00:00, Simulation, for 12s]: daylight (Finished)`.
    pub fn render(&self) -> String {
        let started = self.started_at.format("%Y-%m-%d %H:%M:%S");
        let elapsed = self
            .duration()
            .unwrap_or_else(|| Utc::now() - self.started_at)
            .num_seconds();
        let mut line = format!("[{started}, {}, for {elapsed}s]", self.name);
        if !self.description.is_empty() {
            line.push_str(": ");
            line.push_str(&self.description);
        }
        if let Some(outcome) = &self.outcome {
            line.push_str(&format!(" ({outcome})"));
        }
        line
    }
}

#[derive(Debug, Default)]
struct JournalState {
    open: HashMap<LogEntryId, JournalEntry>,
    finished: VecDeque<JournalEntry>,
}

/// In-memory [`LogSink`].
#[derive(Debug)]
pub struct TaskJournal {
    state: Mutex<JournalState>,
    capacity: usize,
}

impl Default for TaskJournal {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl TaskJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(JournalState::default()),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open tasks, oldest first, optionally filtered by a name substring.
    pub fn open_tasks(&self, filter: Option<&str>) -> Vec<JournalEntry> {
        let mut entries: Vec<JournalEntry> = self
            .state()
            .open
            .values()
            .filter(|entry| matches_filter(entry, filter))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Most recently finished tasks, newest first.
    pub fn latest(&self, limit: usize, filter: Option<&str>) -> Vec<JournalEntry> {
        self.state()
            .finished
            .iter()
            .rev()
            .filter(|entry| matches_filter(entry, filter))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &LogEntryId) -> Option<JournalEntry> {
        let state = self.state();
        state
            .open
            .get(id)
            .or_else(|| state.finished.iter().find(|entry| &entry.id == id))
            .cloned()
    }
}

fn matches_filter(entry: &JournalEntry, filter: Option<&str>) -> bool {
    match filter {
        Some(filter) if !filter.is_empty() => entry
            .name
            .to_lowercase()
            .contains(&filter.to_lowercase()),
        _ => true,
    }
}

impl LogSink for TaskJournal {
    fn add_task_start(&self, name: &str, description: &str, correlation_id: &str) -> LogEntryId {
        let id = LogEntryId::new();
        let entry = JournalEntry {
            id: id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            correlation_id: correlation_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
        };
        self.state().open.insert(id.clone(), entry);
        tracing::info!(task_id = %id.as_str(), name = %name, correlation_id = %correlation_id, "Task started");
        id
    }

    fn finish_task(&self, id: &LogEntryId, outcome: LogOutcome) {
        let mut state = self.state();
        let Some(mut entry) = state.open.remove(id) else {
            tracing::debug!(task_id = %id.as_str(), "Finish for unknown task ignored");
            return;
        };
        entry.finished_at = Some(Utc::now());
        entry.outcome = Some(outcome);
        tracing::info!(
            task_id = %id.as_str(),
            name = %entry.name,
            outcome = %entry.outcome.as_ref().map(ToString::to_string).unwrap_or_default(),
            "Task finished"
        );
        state.finished.push_back(entry);
        while state.finished.len() > self.capacity {
            state.finished.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_moves_from_open_to_history() {
        let journal = TaskJournal::default();
        let id = journal.add_task_start("Simulation", "daylight", "node-1");
        assert_eq!(journal.open_tasks(None).len(), 1);

        journal.finish_task(&id, LogOutcome::Done);
        assert!(journal.open_tasks(None).is_empty());
        let latest = journal.latest(10, None);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].outcome, Some(LogOutcome::Done));
        assert!(latest[0].render().contains("daylight (Finished)"));
    }

    #[test]
    fn test_finish_is_single_shot() {
        let journal = TaskJournal::default();
        let id = journal.add_task_start("A", "", "n");
        journal.finish_task(&id, LogOutcome::Cancelled);
        journal.finish_task(&id, LogOutcome::Done);
        let entry = journal.get(&id).expect("entry kept");
        assert_eq!(entry.outcome, Some(LogOutcome::Cancelled));
        assert_eq!(journal.latest(10, None).len(), 1);
    }

    #[test]
    fn test_history_is_bounded_and_filtered() {
        let journal = TaskJournal::new(3);
        for i in 0..5 {
            let name = if i % 2 == 0 { "upload" } else { "execute" };
            let id = journal.add_task_start(name, "", "n");
            journal.finish_task(&id, LogOutcome::Done);
        }
        assert_eq!(journal.latest(10, None).len(), 3);
        assert_eq!(journal.latest(10, Some("UPLOAD")).len(), 2);
    }
}

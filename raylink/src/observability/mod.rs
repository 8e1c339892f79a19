pub mod journal;

pub use journal::{JournalEntry, LogSink, TaskJournal};

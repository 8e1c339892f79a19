//! Persisted node state
//!
//! Saved as opaque string-keyed chunks:
//!
//! | key                         | value                              |
//! |-----------------------------|------------------------------------|
//! | `cache.{channel}.len`       | number of cached iterations        |
//! | `cache.{channel}.{i}`       | cached value of iteration `i`      |
//! | `lastRunTime`               | last measured run, milliseconds    |
//! | `log.save` ...              | journal settings                   |
//! | `flag.{name}`               | free-form booleans                 |

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const CACHE_PREFIX: &str = "cache.";
const FLAG_PREFIX: &str = "flag.";
const LAST_RUN_KEY: &str = "lastRunTime";

/// Upper bound on cached iterations per channel.
pub const MAX_CACHED_ITERATIONS: usize = 1 << 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    pub save: bool,
    pub name: String,
    pub description_static: String,
    pub description_dynamic: String,
    pub use_fixed_description: bool,
    /// Journal entry of the currently running pass.
    pub correlation_id: Option<String>,
}

impl LogSettings {
    pub fn description(&self) -> &str {
        if self.use_fixed_description || self.description_dynamic.is_empty() {
            &self.description_static
        } else {
            &self.description_dynamic
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub cache: BTreeMap<String, Vec<Option<String>>>,
    pub last_run_ms: Option<u64>,
    pub log: LogSettings,
    pub flags: BTreeMap<String, bool>,
}

impl NodeState {
    pub fn cached(&self, channel: &str, iteration: usize) -> Option<&str> {
        self.cache
            .get(channel)
            .and_then(|values| values.get(iteration))
            .and_then(|value| value.as_deref())
    }

    /// Cache `value` for `iteration`. Iterations at or past
    /// [`MAX_CACHED_ITERATIONS`] are dropped; returns whether it was stored.
    pub fn store(&mut self, channel: &str, iteration: usize, value: Option<String>) -> bool {
        let Some(len) = iteration
            .checked_add(1)
            .filter(|len| *len <= MAX_CACHED_ITERATIONS)
        else {
            tracing::warn!(channel = %channel, iteration, "Iteration out of cache range, not stored");
            return false;
        };
        let values = self.cache.entry(channel.to_string()).or_default();
        if values.len() < len {
            values.resize(len, None);
        }
        values[iteration] = value;
        true
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.last_run_ms = None;
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.flags.get(name).copied()
    }

    pub fn flag_or(&self, name: &str, default: bool) -> bool {
        self.flag(name).unwrap_or(default)
    }

    pub fn set_flag(&mut self, name: &str, value: bool) {
        self.flags.insert(name.to_string(), value);
    }

    pub fn last_run(&self) -> Option<Duration> {
        self.last_run_ms.map(Duration::from_millis)
    }

    pub fn to_chunks(&self) -> StateChunks {
        let mut chunks = StateChunks::default();
        for (channel, values) in &self.cache {
            chunks.set(format!("{CACHE_PREFIX}{channel}.len"), values.len().to_string());
            for (i, value) in values.iter().enumerate() {
                if let Some(value) = value {
                    chunks.set(format!("{CACHE_PREFIX}{channel}.{i}"), value.clone());
                }
            }
        }
        if let Some(ms) = self.last_run_ms {
            chunks.set(LAST_RUN_KEY, ms.to_string());
        }
        chunks.set("log.save", self.log.save.to_string());
        chunks.set("log.name", self.log.name.clone());
        chunks.set("log.description", self.log.description_static.clone());
        chunks.set("log.dynamicDescription", self.log.description_dynamic.clone());
        chunks.set("log.useFixedDescription", self.log.use_fixed_description.to_string());
        if let Some(id) = &self.log.correlation_id {
            chunks.set("log.correlationId", id.clone());
        }
        for (name, value) in &self.flags {
            chunks.set(format!("{FLAG_PREFIX}{name}"), value.to_string());
        }
        chunks
    }

    /// Rebuild from chunks. Unknown or malformed keys are skipped.
    pub fn from_chunks(chunks: &StateChunks) -> Self {
        let mut state = NodeState::default();

        for (key, value) in chunks.iter() {
            if let Some(rest) = key.strip_prefix(CACHE_PREFIX) {
                if let Some(channel) = rest.strip_suffix(".len") {
                    match value.parse::<usize>() {
                        Ok(len) if len <= MAX_CACHED_ITERATIONS => {
                            let values = state.cache.entry(channel.to_string()).or_default();
                            if values.len() < len {
                                values.resize(len, None);
                            }
                        }
                        _ => tracing::debug!(key = %key, value = %value, "Skipping malformed cache length"),
                    }
                } else if let Some((channel, index)) = rest.rsplit_once('.') {
                    let stored = index
                        .parse::<usize>()
                        .map(|index| state.store(channel, index, Some(value.to_string())))
                        .unwrap_or(false);
                    if !stored {
                        tracing::debug!(key = %key, "Skipping malformed cache entry");
                    }
                }
            } else if let Some(name) = key.strip_prefix(FLAG_PREFIX) {
                if let Ok(flag) = value.parse::<bool>() {
                    state.flags.insert(name.to_string(), flag);
                }
            } else {
                match key {
                    LAST_RUN_KEY => state.last_run_ms = value.parse().ok(),
                    "log.save" => state.log.save = value == "true",
                    "log.name" => state.log.name = value.to_string(),
                    "log.description" => state.log.description_static = value.to_string(),
                    "log.dynamicDescription" => state.log.description_dynamic = value.to_string(),
                    "log.useFixedDescription" => state.log.use_fixed_description = value == "true",
                    "log.correlationId" => state.log.correlation_id = Some(value.to_string()),
                    _ => tracing::debug!(key = %key, "Ignoring unknown state chunk"),
                }
            }
        }
        state
    }
}

/// Opaque string-keyed record the host stores with the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateChunks(BTreeMap<String, String>);

impl StateChunks {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

//! `<Key>` placeholder substitution for command text and remote paths
//!
//! Three layers are consulted, highest priority first: per-call locals, user
//! globals, session globals (written on connect). Keys are case-insensitive.
//!
//! Placeholder forms:
//! - `<Key>`: the value
//! - `<Key-N>`: a numeric value minus N, otherwise the value without its last N chars
//! - `<Key-.>`: the value without its file extension

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use super::paths::SessionPaths;

pub const DEFAULT_MAX_DEPTH: usize = 3;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<([A-Za-z]+[0-9]*)(?:-([0-9]+|\.))?>").expect("placeholder pattern is valid")
});

/// Result of a substitution run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub text: String,
    /// Keys that had no value; their placeholders are left verbatim.
    pub missing: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Globals {
    session: RwLock<HashMap<String, String>>,
    user: RwLock<HashMap<String, String>>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the well-known keys of a freshly connected session.
    pub fn set_session_paths(&self, paths: &SessionPaths) {
        let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
        session.clear();
        session.insert("winhome".to_string(), paths.local_home());
        session.insert("linuxhome".to_string(), paths.remote_home());
        session.insert("project".to_string(), paths.project().to_string());
        session.insert("sftphome".to_string(), paths.upload_home());
    }

    pub fn clear_session(&self) {
        self.session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.user
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_lowercase(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.user
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key.to_lowercase())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let key = key.to_lowercase();
        if let Some(value) = self
            .user
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Some(value.clone());
        }
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    /// Every visible key/value, lowercased keys, user values shadowing session ones.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let mut merged: BTreeMap<String, String> = self
            .session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in self.user.read().unwrap_or_else(|e| e.into_inner()).iter() {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    pub fn apply(&self, text: &str) -> Substitution {
        self.apply_with(text, &HashMap::new(), DEFAULT_MAX_DEPTH)
    }

    pub fn apply_with(
        &self,
        text: &str,
        locals: &HashMap<String, String>,
        max_depth: usize,
    ) -> Substitution {
        let mut values = self.snapshot();
        for (k, v) in locals {
            values.insert(k.to_lowercase(), v.clone());
        }
        apply_globals(text, &values, max_depth)
    }
}

/// Substitute placeholders using `values` (lowercased keys).
///
/// Runs at most `max_depth + 1` rounds so values may themselves contain
/// placeholders.
pub fn apply_globals(text: &str, values: &BTreeMap<String, String>, max_depth: usize) -> Substitution {
    let mut current = text.replace('\u{2212}', "-");
    let mut missing = BTreeSet::new();

    for _ in 0..=max_depth {
        let next = PLACEHOLDER
            .replace_all(&current, |caps: &Captures| {
                let whole = caps[0].to_string();
                let key = caps[1].to_lowercase();
                let Some(value) = values.get(&key) else {
                    missing.insert(caps[1].to_string());
                    return whole;
                };
                match caps.get(2).map(|m| m.as_str()) {
                    None => value.clone(),
                    Some(".") => strip_extension(value),
                    Some(count) => count
                        .parse::<usize>()
                        .ok()
                        .and_then(|n| strip_or_subtract(value, n))
                        .unwrap_or(whole),
                }
            })
            .into_owned();
        if next == current {
            break;
        }
        current = next;
    }

    // A key that resolved in a later round is no longer missing.
    let missing = missing
        .into_iter()
        .filter(|key| !values.contains_key(&key.to_lowercase()))
        .collect();

    Substitution {
        text: current,
        missing,
    }
}

fn strip_extension(value: &str) -> String {
    match value.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() && !stem.ends_with('/') => stem.to_string(),
        _ => value.to_string(),
    }
}

/// `None` when a numeric value cannot be reduced by `n` without overflow.
fn strip_or_subtract(value: &str, n: usize) -> Option<String> {
    if let Ok(number) = value.trim().parse::<i64>() {
        let n = i64::try_from(n).ok()?;
        return number.checked_sub(n).map(|result| result.to_string());
    }
    let keep = value.chars().count().saturating_sub(n);
    Some(value.chars().take(keep).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plain_keys_are_case_insensitive() {
        let result = apply_globals("cd <linuxhome> && ls <LinuxHome>", &values(&[("LinuxHome", "~/r/p")]), 3);
        assert_eq!(result.text, "cd ~/r/p && ls ~/r/p");
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_unknown_keys_stay_verbatim_and_are_reported() {
        let result = apply_globals("echo <Nope> <Nope-2>", &BTreeMap::new(), 3);
        assert_eq!(result.text, "echo <Nope> <Nope-2>");
        assert_eq!(result.missing, vec!["Nope".to_string()]);
    }

    #[test]
    fn test_numeric_suffix_subtracts_or_strips() {
        let vals = values(&[("Count", "10"), ("Name", "scene_v2")]);
        assert_eq!(apply_globals("<Count-3>", &vals, 3).text, "7");
        assert_eq!(apply_globals("<Name-3>", &vals, 3).text, "scene");
    }

    #[test]
    fn test_overflowing_subtraction_stays_verbatim() {
        let globals = values(&[("N", "-2"), ("Name", "scene")]);
        let result = apply_globals("<N-9223372036854775807> <N-18446744073709551615>", &globals, 3);
        assert_eq!(result.text, "<N-9223372036854775807> <N-18446744073709551615>");
        assert!(result.missing.is_empty());

        let result = apply_globals("<N-9223372036854775806> <Name-18446744073709551615>", &globals, 3);
        assert_eq!(result.text, "-9223372036854775808 ");
    }

    #[test]
    fn test_dot_suffix_strips_extension() {
        let vals = values(&[("File", "model.rad"), ("Bare", "model")]);
        assert_eq!(apply_globals("<File-.>.oct", &vals, 3).text, "model.oct");
        assert_eq!(apply_globals("<Bare-.>", &vals, 3).text, "model");
    }

    #[test]
    fn test_nested_values_resolve_up_to_depth() {
        let vals = values(&[("A", "<B>/a"), ("B", "<C>/b"), ("C", "root")]);
        assert_eq!(apply_globals("<A>", &vals, 3).text, "root/b/a");
        assert_eq!(apply_globals("<A>", &vals, 0).text, "<B>/a");
    }

    #[test]
    fn test_unicode_minus_is_accepted() {
        let vals = values(&[("Count", "5")]);
        assert_eq!(apply_globals("<Count\u{2212}1>", &vals, 3).text, "4");
    }

    #[test]
    fn test_layers_shadow_in_order() {
        let globals = Globals::new();
        globals.set_session_paths(&SessionPaths::new("~/sims", "/tmp/local", "office"));
        assert_eq!(globals.apply("<Project>").text, "office");

        globals.set("project", "override");
        assert_eq!(globals.apply("<Project>").text, "override");

        let mut locals = HashMap::new();
        locals.insert("PROJECT".to_string(), "local".to_string());
        assert_eq!(globals.apply_with("<Project>", &locals, 3).text, "local");

        globals.remove("Project");
        assert_eq!(globals.apply("<LinuxHome>/<Project>").text, "~/sims/office/office");
    }
}

//! Conflict resolution for concurrent writes.
//!
//! A resolver only runs when two entries have `Concurrent` vector clocks. It
//! picks or builds the surviving value; the caller merges the clocks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use super::entry::MemoryEntry;

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub resolved: MemoryEntry,
    /// Candidates whose value did not survive unchanged.
    pub discarded: Vec<MemoryEntry>,
}

impl Resolution {
    fn pick(winner: &MemoryEntry, loser: &MemoryEntry) -> Self {
        Self {
            resolved: winner.clone(),
            discarded: vec![loser.clone()],
        }
    }

    /// `value` written with the newer candidate's metadata.
    fn merged(value: Value, a: &MemoryEntry, b: &MemoryEntry) -> Self {
        let (newer, _) = newer_older(a, b);
        let resolved = MemoryEntry {
            value,
            ..newer.clone()
        };
        let discarded = [a, b]
            .into_iter()
            .filter(|e| e.value != resolved.value)
            .cloned()
            .collect();
        Self { resolved, discarded }
    }
}

/// Picks a single entry out of two concurrent writes to the same key.
pub trait ConflictResolver: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn resolve(&self, local: &MemoryEntry, remote: &MemoryEntry) -> Resolution;
}

fn newer_older<'a>(a: &'a MemoryEntry, b: &'a MemoryEntry) -> (&'a MemoryEntry, &'a MemoryEntry) {
    if a.is_newer_than(b) {
        (a, b)
    } else {
        (b, a)
    }
}

/// Later wall-clock write wins; equal timestamps go to the larger writer id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn name(&self) -> &'static str {
        "last_write_wins"
    }

    fn resolve(&self, local: &MemoryEntry, remote: &MemoryEntry) -> Resolution {
        let (newer, older) = newer_older(local, remote);
        Resolution::pick(newer, older)
    }
}

/// Set union of two arrays, older elements first. Non-arrays fall back to last-write-wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayMerge;

impl ConflictResolver for ArrayMerge {
    fn name(&self) -> &'static str {
        "array_merge"
    }

    fn resolve(&self, local: &MemoryEntry, remote: &MemoryEntry) -> Resolution {
        let (newer, older) = newer_older(local, remote);
        match (&older.value, &newer.value) {
            (Value::Array(first), Value::Array(second)) => {
                let mut union: Vec<Value> = Vec::with_capacity(first.len() + second.len());
                for item in first.iter().chain(second) {
                    if !union.contains(item) {
                        union.push(item.clone());
                    }
                }
                Resolution::merged(Value::Array(union), local, remote)
            }
            _ => LastWriteWins.resolve(local, remote),
        }
    }
}

/// Deep merge of two objects; on a clash the newer write's field wins.
/// Non-objects fall back to last-write-wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectMerge;

fn deep_merge(older: &Map<String, Value>, newer: &Map<String, Value>) -> Map<String, Value> {
    let mut out = older.clone();
    for (key, value) in newer {
        let merged = match (out.get(key), value) {
            (Some(Value::Object(a)), Value::Object(b)) => Value::Object(deep_merge(a, b)),
            _ => value.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}

impl ConflictResolver for ObjectMerge {
    fn name(&self) -> &'static str {
        "object_merge"
    }

    fn resolve(&self, local: &MemoryEntry, remote: &MemoryEntry) -> Resolution {
        let (newer, older) = newer_older(local, remote);
        match (&older.value, &newer.value) {
            (Value::Object(a), Value::Object(b)) => Resolution::merged(Value::Object(deep_merge(a, b)), local, remote),
            _ => LastWriteWins.resolve(local, remote),
        }
    }
}

/// Numeric maximum. Non-numbers and ties fall back to last-write-wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxValue;

impl ConflictResolver for MaxValue {
    fn name(&self) -> &'static str {
        "max_value"
    }

    fn resolve(&self, local: &MemoryEntry, remote: &MemoryEntry) -> Resolution {
        match (local.value.as_f64(), remote.value.as_f64()) {
            (Some(a), Some(b)) if a > b => Resolution::pick(local, remote),
            (Some(a), Some(b)) if b > a => Resolution::pick(remote, local),
            _ => LastWriteWins.resolve(local, remote),
        }
    }
}

/// Built-in resolvers, selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    #[default]
    LastWriteWins,
    ArrayMerge,
    ObjectMerge,
    MaxValue,
}

impl ResolverKind {
    #[must_use]
    pub fn build(self) -> Arc<dyn ConflictResolver> {
        match self {
            Self::LastWriteWins => Arc::new(LastWriteWins),
            Self::ArrayMerge => Arc::new(ArrayMerge),
            Self::ObjectMerge => Arc::new(ObjectMerge),
            Self::MaxValue => Arc::new(MaxValue),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::*;
    use crate::vector_clock::VectorClock;

    fn pair(a: Value, b: Value) -> (MemoryEntry, MemoryEntry) {
        let now = Utc::now();
        let clock_a: VectorClock = [("A", 1)].into_iter().collect();
        let clock_b: VectorClock = [("B", 1)].into_iter().collect();
        (
            MemoryEntry::new("k", a, clock_a, "A", now, None),
            MemoryEntry::new("k", b, clock_b, "B", now + Duration::milliseconds(5), None),
        )
    }

    #[test]
    fn test_last_write_wins_picks_later_timestamp() {
        let (a, b) = pair(json!("old"), json!("new"));
        let r = LastWriteWins.resolve(&a, &b);
        assert_eq!(r.resolved.value, json!("new"));
        assert_eq!(r.discarded, vec![a.clone()]);
        assert_eq!(LastWriteWins.resolve(&b, &a).resolved.value, json!("new"));
    }

    #[test]
    fn test_array_merge_unions() {
        let (a, b) = pair(json!([1, 2]), json!([2, 3]));
        let r = ArrayMerge.resolve(&a, &b);
        assert_eq!(r.resolved.value, json!([1, 2, 3]));
        assert_eq!(r.resolved.writer_worker_id, "B");
        assert_eq!(r.discarded.len(), 2);
    }

    #[test]
    fn test_object_merge_is_deep_and_newer_wins() {
        let (a, b) = pair(
            json!({"status": "running", "progress": {"done": 1, "total": 10}}),
            json!({"status": "paused", "progress": {"done": 3}}),
        );
        let r = ObjectMerge.resolve(&a, &b);
        assert_eq!(
            r.resolved.value,
            json!({"status": "paused", "progress": {"done": 3, "total": 10}})
        );
    }

    #[test]
    fn test_max_value_ignores_timestamps() {
        let (a, b) = pair(json!(10), json!(7));
        assert_eq!(MaxValue.resolve(&a, &b).resolved.value, json!(10));
        let (c, d) = pair(json!("x"), json!(7));
        assert_eq!(MaxValue.resolve(&c, &d).resolved.value, json!(7));
    }

    #[test]
    fn test_kind_parses_from_config_names() -> Result<(), strum::ParseError> {
        assert_eq!("object_merge".parse::<ResolverKind>()?, ResolverKind::ObjectMerge);
        assert_eq!(ResolverKind::MaxValue.build().name(), "max_value");
        Ok(())
    }
}

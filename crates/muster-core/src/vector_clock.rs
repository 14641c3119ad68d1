//! Vector clocks for causality tracking between memory writes.
//!
//! A clock maps worker ids to counters. A worker only ever increments its
//! own counter; clocks from different workers are combined with `merge`
//! (pointwise max). Missing entries read as 0.
//!
//! Complexity:
//! - increment: O(log n)
//! - compare / merge: O(n) over the union of workers

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Causal relation of one clock to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    /// Every counter is <= the other's, at least one strictly less.
    Before,
    /// Every counter is >= the other's, at least one strictly greater.
    After,
    Equal,
    /// Neither dominates.
    Concurrent,
}

impl ClockOrdering {
    /// The relation seen from the other side.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Before => Self::After,
            Self::After => Self::Before,
            other => other,
        }
    }
}

/// Per-key map of worker id to logical counter.
///
/// Backed by a `BTreeMap` so serialised clocks are byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `worker`, 0 when absent.
    #[must_use]
    pub fn get(&self, worker: &str) -> u64 {
        self.entries.get(worker).copied().unwrap_or(0)
    }

    /// Bump `worker`'s own counter and return the new value.
    pub fn increment(&mut self, worker: &str) -> u64 {
        let counter = self.entries.entry(worker.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Pointwise comparison across the union of keys.
    #[must_use]
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for worker in self.entries.keys().chain(other.entries.keys()) {
            match self.get(worker).cmp(&other.get(worker)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Pointwise max, in place.
    pub fn merge(&mut self, other: &Self) {
        for (worker, &counter) in &other.entries {
            let entry = self.entries.entry(worker.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Pointwise max of two clocks.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// `self` is after or equal to `other`.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|&c| c == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            ClockOrdering::Before => Some(Ordering::Less),
            ClockOrdering::After => Some(Ordering::Greater),
            ClockOrdering::Equal => Some(Ordering::Equal),
            ClockOrdering::Concurrent => None,
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (worker, counter)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{worker}:{counter}")?;
        }
        write!(f, "}}")
    }
}

//! Causal ordering of foreign entries.
//!
//! Entries are applied parents-first. Among entries that are ready at the
//! same time, the one with the smaller `(timestamp, entry id)` goes first,
//! so every node applies a given set of entries in the same order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use dsnet_core::{EntryId, LogEntry};

/// Outcome of one [`Logbook::merge_foreign`] call.
///
/// [`Logbook::merge_foreign`]: crate::Logbook::merge_foreign
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Entries applied, in application order.
    pub applied: Vec<EntryId>,
    /// Entries already in the log or already buffered.
    pub duplicates: Vec<EntryId>,
    /// Entries that failed validation, with the reason.
    pub invalid: Vec<(EntryId, String)>,
    /// Entries still waiting on a parent after this call.
    pub buffered: Vec<EntryId>,
    /// Parentless entries turned away because the buffer was full.
    pub dropped: Vec<EntryId>,
    /// Applied entries that forked an author's chain.
    pub forks: Vec<EntryId>,
}

impl MergeReport {
    /// Whether the call changed the log.
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }

    pub(crate) fn absorb(&mut self, other: MergeReport) {
        self.applied.extend(other.applied);
        self.duplicates.extend(other.duplicates);
        self.invalid.extend(other.invalid);
        self.buffered.extend(other.buffered);
        self.dropped.extend(other.dropped);
        self.forks.extend(other.forks);
    }
}

/// Order `candidates` for application.
///
/// An entry is ready when it has no parent, its parent is in `present`, or
/// its parent was ordered before it. Returns the ordered entries and the
/// ones whose parent never became available.
pub fn causal_order(
    mut candidates: HashMap<EntryId, LogEntry>,
    present: &HashSet<EntryId>,
) -> (Vec<(EntryId, LogEntry)>, HashMap<EntryId, LogEntry>) {
    let mut waiting: HashMap<EntryId, Vec<EntryId>> = HashMap::new();
    let mut ready = BinaryHeap::new();

    for (id, entry) in &candidates {
        match entry.parent() {
            Some(parent) if !present.contains(&parent) => {
                waiting.entry(parent).or_default().push(*id);
            }
            _ => ready.push(Reverse((entry.timestamp(), *id))),
        }
    }

    let mut order = Vec::with_capacity(candidates.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        let Some(entry) = candidates.remove(&id) else {
            continue;
        };
        for child in waiting.remove(&id).unwrap_or_default() {
            if let Some(child_entry) = candidates.get(&child) {
                ready.push(Reverse((child_entry.timestamp(), child)));
            }
        }
        order.push((id, entry));
    }

    (order, candidates)
}

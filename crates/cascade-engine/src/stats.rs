//! Counters and runaway detection.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use cascade_core::{ObjectId, ObserverId, ObserverTrace, PropertyId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Point-in-time copy of the universe counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Actions processed since start.
    pub actions: u64,
    /// Leaf transactions run since start.
    pub leaf_runs: u64,
    /// Changing observer runs in the current action.
    pub changes: u64,
    /// Changing observer runs since start.
    pub total_changes: u64,
    /// Observer instances with a non-empty dependency set.
    pub observer_instances: i64,
    /// Whether runaway tracing is on.
    pub debugging: bool,
}

#[derive(Debug, Default)]
pub struct UniverseStatistics {
    actions: AtomicU64,
    leaf_runs: AtomicU64,
    changes: AtomicU64,
    total_changes: AtomicU64,
    instances: AtomicI64,
    debugging: AtomicBool,
    per_instance: DashMap<(ObjectId, ObserverId), u32>,
    writers: DashMap<(ObjectId, PropertyId), (u64, Arc<ObserverTrace>)>,
    trace_seq: AtomicU64,
}

impl UniverseStatistics {
    /// Reset the per-action counters.
    pub fn begin_action(&self) {
        self.actions.fetch_add(1, Ordering::Relaxed);
        self.changes.store(0, Ordering::Relaxed);
        self.debugging.store(false, Ordering::Relaxed);
        self.per_instance.clear();
        self.writers.clear();
    }

    pub fn count_leaf(&self) {
        self.leaf_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a changing run; returns the instance count and the action total.
    pub fn count_change(&self, object: ObjectId, observer: ObserverId) -> (u32, u64) {
        let per_instance = {
            let mut entry = self.per_instance.entry((object, observer)).or_insert(0);
            *entry += 1;
            *entry
        };
        self.total_changes.fetch_add(1, Ordering::Relaxed);
        let total = self.changes.fetch_add(1, Ordering::Relaxed) + 1;
        (per_instance, total)
    }

    pub fn instance_added(&self) {
        self.instances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_removed(&self) {
        self.instances.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn debugging(&self) -> bool {
        self.debugging.load(Ordering::Relaxed)
    }

    /// Turn on runaway tracing for the rest of the action.
    pub fn start_debugging(&self, object: ObjectId, observer: &str, count: u32) {
        if !self.debugging.swap(true, Ordering::Relaxed) {
            warn!(%object, observer, count, "runaway_suspected");
        }
    }

    /// Most recent traced run that wrote one of `reads`.
    pub fn last_writer(&self, reads: &[(ObjectId, PropertyId)]) -> Option<Arc<ObserverTrace>> {
        reads
            .iter()
            .filter_map(|key| self.writers.get(key).map(|w| w.value().clone()))
            .max_by_key(|(seq, _)| *seq)
            .map(|(_, trace)| trace)
    }

    pub fn record_writes(&self, writes: &[(ObjectId, PropertyId)], trace: &Arc<ObserverTrace>) {
        let seq = self.trace_seq.fetch_add(1, Ordering::Relaxed);
        for key in writes {
            self.writers.insert(*key, (seq, trace.clone()));
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            actions: self.actions.load(Ordering::Relaxed),
            leaf_runs: self.leaf_runs.load(Ordering::Relaxed),
            changes: self.changes.load(Ordering::Relaxed),
            total_changes: self.total_changes.load(Ordering::Relaxed),
            observer_instances: self.instances.load(Ordering::Relaxed),
            debugging: self.debugging(),
        }
    }
}

//! Engine configuration.
//!
//! Every knob affects diagnostics or runaway thresholds only; none of them
//! changes what a settled state looks like.

use serde::{Deserialize, Serialize};

/// Configuration for a universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the action queue; `put` blocks when full.
    pub max_in_queue: usize,

    /// Runs with changes per observer instance per action before the engine
    /// switches to tracing.
    pub max_nr_of_changes: u32,

    /// Changes across all observers per action before tracing starts.
    pub max_total_nr_of_changes: u64,

    /// Distinct observed values per observer instance.
    pub max_nr_of_observed: usize,

    /// Observer instances reading one property of one object.
    pub max_nr_of_observers: usize,

    /// Depth of the time-travel history.
    pub max_nr_of_history: usize,

    /// Report orphans that still carry user state.
    pub check_orphan_state: bool,

    /// Check every rooted object after each action instead of changed ones.
    pub dev_mode: bool,

    /// Run observers of a micro-cycle on the scheduler thread only.
    pub run_sequential: bool,

    /// Worker threads for parallel observer runs.
    pub parallelism: usize,

    pub trace_universe: bool,
    pub trace_actions: bool,
    pub trace_matching: bool,
    pub trace_ripple_out: bool,
    pub trace_derivation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_queue: 100,
            max_nr_of_changes: 16,
            max_total_nr_of_changes: 1000,
            max_nr_of_observed: 40,
            max_nr_of_observers: 40,
            max_nr_of_history: 64,
            check_orphan_state: true,
            dev_mode: false,
            run_sequential: false,
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            trace_universe: false,
            trace_actions: false,
            trace_matching: false,
            trace_ripple_out: false,
            trace_derivation: false,
        }
    }
}

impl EngineConfig {
    /// Strict checks, sequential execution, verbose tracing.
    pub fn dev() -> Self {
        Self {
            dev_mode: true,
            run_sequential: true,
            trace_universe: true,
            trace_actions: true,
            ..Default::default()
        }
    }

    /// Generous limits and no orphan checks, for large graphs.
    pub fn fast() -> Self {
        Self {
            max_nr_of_changes: 64,
            max_total_nr_of_changes: 100_000,
            max_nr_of_observed: 1000,
            max_nr_of_observers: 1000,
            max_nr_of_history: 8,
            check_orphan_state: false,
            ..Default::default()
        }
    }

    pub fn with_max_in_queue(mut self, n: usize) -> Self {
        self.max_in_queue = n.max(1);
        self
    }

    pub fn with_max_nr_of_changes(mut self, n: u32) -> Self {
        self.max_nr_of_changes = n;
        self
    }

    pub fn with_max_total_nr_of_changes(mut self, n: u64) -> Self {
        self.max_total_nr_of_changes = n;
        self
    }

    pub fn with_max_nr_of_observed(mut self, n: usize) -> Self {
        self.max_nr_of_observed = n;
        self
    }

    pub fn with_max_nr_of_observers(mut self, n: usize) -> Self {
        self.max_nr_of_observers = n;
        self
    }

    pub fn with_max_nr_of_history(mut self, n: usize) -> Self {
        self.max_nr_of_history = n;
        self
    }

    pub fn with_check_orphan_state(mut self, check: bool) -> Self {
        self.check_orphan_state = check;
        self
    }

    pub fn with_run_sequential(mut self, sequential: bool) -> Self {
        self.run_sequential = sequential;
        self
    }

    pub fn with_parallelism(mut self, workers: usize) -> Self {
        self.parallelism = workers.max(1);
        self
    }

    /// Worker count to use for a batch of `items` leaves.
    pub fn workers_for(&self, items: usize) -> usize {
        if self.run_sequential {
            1
        } else {
            self.parallelism.min(items).max(1)
        }
    }
}

//! Status channel of a universe.
//!
//! The scheduler publishes a [`Status`] after every action; callers block on
//! it until a predicate holds.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cascade_core::{ActionId, State};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Starting,
    Busy,
    Idle,
    Stopped,
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mood::Starting => "starting",
            Mood::Busy => "busy",
            Mood::Idle => "idle",
            Mood::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What the universe is doing, plus its last settled state.
#[derive(Debug, Clone)]
pub struct Status {
    pub mood: Mood,
    /// Action being processed.
    pub action: Option<Arc<str>>,
    /// Last action processed, if any.
    pub completed: Option<ActionId>,
    /// Actions accepted but not yet taken off the queue.
    pub queued: usize,
    pub state: State,
    pub stats: StatsSnapshot,
    /// Imperatives with a commit in flight.
    pub active: BTreeSet<Arc<str>>,
}

impl Status {
    fn new() -> Self {
        Self {
            mood: Mood::Starting,
            action: None,
            completed: None,
            queued: 0,
            state: State::new(),
            stats: StatsSnapshot::default(),
            active: BTreeSet::new(),
        }
    }

    /// Nothing queued, nothing running, no imperative committing.
    pub fn is_idle(&self) -> bool {
        self.mood == Mood::Idle && self.queued == 0 && self.active.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.mood == Mood::Stopped
    }

    pub fn has_completed(&self, action: ActionId) -> bool {
        self.completed.is_some_and(|done| done >= action)
    }
}

/// Shared, waitable [`Status`].
pub struct StatusProvider {
    status: Mutex<Status>,
    changed: Condvar,
}

impl Default for StatusProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusProvider {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(Status::new()),
            changed: Condvar::new(),
        }
    }

    pub fn current(&self) -> Status {
        self.status.lock().clone()
    }

    /// Mutate the status and wake every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut Status) -> R) -> R {
        let result = f(&mut self.status.lock());
        self.changed.notify_all();
        result
    }

    /// Block until `predicate` holds or the universe stopped.
    pub fn wait_for(&self, predicate: impl Fn(&Status) -> bool) -> Status {
        let mut status = self.status.lock();
        while !predicate(&status) && !status.is_stopped() {
            self.changed.wait(&mut status);
        }
        status.clone()
    }

    /// [`StatusProvider::wait_for`] with a deadline; `None` on timeout.
    pub fn wait_for_timeout(&self, predicate: impl Fn(&Status) -> bool, timeout: Duration) -> Option<Status> {
        let deadline = std::time::Instant::now() + timeout;
        let mut status = self.status.lock();
        while !predicate(&status) && !status.is_stopped() {
            if self.changed.wait_until(&mut status, deadline).timed_out() {
                return predicate(&status).then(|| status.clone());
            }
        }
        Some(status.clone())
    }

    pub fn wait_for_idle(&self) -> Status {
        self.wait_for(Status::is_idle)
    }

    pub fn wait_for_busy(&self) -> Status {
        self.wait_for(|s| s.mood == Mood::Busy)
    }

    pub fn wait_for_stopped(&self) -> Status {
        self.wait_for(Status::is_stopped)
    }
}

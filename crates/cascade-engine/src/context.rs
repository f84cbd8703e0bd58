//! State shared by every transaction of one universe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cascade_core::{
    ActionId, ClassSpec, EngineConfig, EngineError, EngineResult, NewableSpec, ObjectId,
    ObserverId, Priority, PropertyId, Registry, State, Value,
};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tracing::error;

use crate::objects::ObjectTable;
use crate::stats::UniverseStatistics;
use crate::transaction::{Action, LeafPool};

/// Everything a leaf needs besides the state it runs on.
pub(crate) struct Shared {
    pub registry: Arc<Registry>,
    pub objects: ObjectTable,
    pub config: EngineConfig,
    pub stats: UniverseStatistics,
    /// Memoized constants per object.
    pub constants: DashMap<(ObjectId, PropertyId), Value>,
    /// Actions currently queued in the state.
    pub actions: DashMap<ActionId, Action>,
    /// Observer instances halted by a consistency error.
    pub stopped: DashSet<(ObjectId, ObserverId)>,
    pub pool: LeafPool,
    errors: Mutex<Vec<EngineError>>,
    killed: AtomicBool,
}

impl Shared {
    pub fn new(registry: Arc<Registry>, config: EngineConfig) -> Self {
        Self {
            registry,
            objects: ObjectTable::new(cascade_core::ClassId::UNIVERSE),
            config,
            stats: UniverseStatistics::default(),
            constants: DashMap::new(),
            actions: DashMap::new(),
            stopped: DashSet::new(),
            pool: LeafPool::default(),
            errors: Mutex::new(Vec::new()),
            killed: AtomicBool::new(false),
        }
    }

    /// Record a fatal error; the engine stops accepting work.
    pub fn fail(&self, error: EngineError) {
        error!(%error, kind = ?error.kind(), "engine_error");
        self.errors.lock().push(error);
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Recorded errors in reporting order.
    pub fn errors(&self) -> Vec<EngineError> {
        let mut errors = self.errors.lock().clone();
        errors.sort_by(EngineError::report_order);
        errors
    }

    pub fn class(&self, object: ObjectId) -> EngineResult<&ClassSpec> {
        let class = self
            .objects
            .class_of(object)
            .ok_or(EngineError::UnknownObject(object))?;
        self.registry.class(class)
    }

    pub fn newable(&self, object: ObjectId) -> Option<&NewableSpec> {
        self.class(object).ok().and_then(|c| c.newable.as_ref())
    }

    pub fn is_stopped(&self, object: ObjectId, observer: ObserverId) -> bool {
        self.stopped.contains(&(object, observer))
    }

    /// Drop memoized facts about an object whose state was cleared.
    pub fn forget(&self, object: ObjectId) {
        self.constants.retain(|(o, _), _| *o != object);
        self.stopped.retain(|(o, _)| *o != object);
    }
}

/// Reference snapshots for ripple-out decisions within one action.
#[derive(Clone)]
pub(crate) struct Snapshots {
    /// State before the action ran.
    pub action_start: State,
    /// Start of the current cycle of each deferring tier.
    starts: [State; Priority::DEFERRING.len()],
    /// Start of the outer cycle before the current one.
    pub prev_outer: State,
    /// Earlier settled states, newest first.
    pub history: Arc<Vec<State>>,
}

impl Snapshots {
    pub fn new(start: &State, history: Arc<Vec<State>>) -> Self {
        Self {
            action_start: start.clone(),
            starts: std::array::from_fn(|_| start.clone()),
            prev_outer: start.clone(),
            history,
        }
    }

    pub fn start(&self, tier: Priority) -> &State {
        match tier.deferral_index() {
            Some(i) => &self.starts[i],
            None => &self.action_start,
        }
    }

    /// Open a new cycle of `tier`, which also opens every tier before it.
    pub fn enter(&mut self, tier: Priority, state: &State) {
        let Some(last) = tier.deferral_index() else {
            return;
        };
        let outer = Priority::Outer.deferral_index();
        for i in 0..=last {
            let previous = std::mem::replace(&mut self.starts[i], state.clone());
            if Some(i) == outer {
                self.prev_outer = previous;
            }
        }
    }
}

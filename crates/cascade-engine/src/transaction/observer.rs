//! Observer runs: tracked reads, matched and rippled writes.
//!
//! An observer transaction records every observed property it reads. At the
//! end of the run that record replaces the instance's dependency set and the
//! reverse reader index is patched with the difference. A run that changed
//! observed values re-triggers itself; a run that had writes deferred
//! re-triggers itself at the deferral tier.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use cascade_core::{
    Cell, ClassId, Construction, Dependencies, Direction, EngineError, EngineResult, Leaf,
    ObjectId, ObserverId, ObserverSpec, ObserverTrace, Observee, Priority, PropertyId,
    PropertySpec, Queued, Reader, Reason, Slot, State, TracedValue, Value,
};
use tracing::{debug, warn};

use super::leaf::LeafCore;
use super::{panic_message, Transaction, TransactionKind};
use crate::context::{Shared, Snapshots};

/// Runs kept in a runaway trace and tolerated past the change limit.
const TRACE_DEPTH: u32 = 16;

pub struct ObserverTransaction<'a> {
    pub(crate) core: LeafCore<'a>,
    pub(crate) observer: &'a ObserverSpec,
    observeds: Dependencies,
    /// What this run constructed, by reason.
    pub(crate) constructions: BTreeMap<Reason, ObjectId>,
    written: BTreeSet<(ObjectId, PropertyId)>,
    /// Most urgent tier a write was deferred to.
    pub(crate) defer: Option<Priority>,
    empty_mandatory: bool,
    /// Constants being initialized, innermost last.
    initializing: Vec<(ObjectId, PropertyId)>,
    debugging: bool,
    reads: Vec<(ObjectId, PropertyId, Value)>,
    writes: Vec<(ObjectId, PropertyId, Value)>,
}

impl<'a> ObserverTransaction<'a> {
    /// Run `observer` on `queued.target` from `state`.
    pub(crate) fn run(
        shared: &'a Shared,
        snapshots: &'a Snapshots,
        state: &State,
        queued: Queued,
        observer: ObserverId,
    ) -> State {
        let spec = match shared.registry.observer(observer) {
            Ok(spec) => spec,
            Err(e) => {
                shared.fail(e);
                return state.clone();
            }
        };
        let target = queued.target;
        if !state.is_active(target) || shared.is_stopped(target, observer) {
            return state.clone();
        }
        let _guard = match shared.pool.open(TransactionKind::Observer, queued) {
            Ok(guard) => guard,
            Err(e) => {
                shared.fail(e);
                return state.clone();
            }
        };
        shared.stats.count_leaf();

        let mut tx = ObserverTransaction::new(shared, snapshots, state, queued, spec);
        let outcome = catch_unwind(AssertUnwindSafe(|| spec.run(&mut tx)))
            .unwrap_or_else(|payload| Err(EngineError::failed(panic_message(payload))));
        tx.finish(outcome)
    }

    pub(crate) fn new(
        shared: &'a Shared,
        snapshots: &'a Snapshots,
        state: &State,
        queued: Queued,
        observer: &'a ObserverSpec,
    ) -> Self {
        Self {
            core: LeafCore::new(shared, snapshots, state, queued),
            observer,
            observeds: Dependencies::new(),
            constructions: BTreeMap::new(),
            written: BTreeSet::new(),
            defer: None,
            empty_mandatory: false,
            initializing: Vec::new(),
            debugging: shared.stats.debugging(),
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    fn finish(mut self, outcome: EngineResult<()>) -> State {
        let target = self.core.target;
        let observer = self.observer;
        let mut failure = match outcome {
            Ok(()) | Err(EngineError::EmptyMandatory { .. }) => None,
            Err(e) if e.is_consistency() => Some(e),
            Err(e) => Some(EngineError::ObserverFailed {
                object: target,
                observer: observer.name.to_string(),
                message: e.to_string(),
            }),
        };
        if let Err(e) = self.check_observed() {
            failure.get_or_insert(e);
        }

        let changed = self.changed();
        if changed && (self.defer.is_none() || !observer.atomic) {
            match self.count_change() {
                Ok(()) => self.core.trigger(target, observer.id, Priority::One),
                Err(e) => failure = Some(e),
            }
        } else if let Some(tier) = self.defer {
            if observer.atomic {
                self.rollback();
            }
            self.core.trigger(target, observer.id, tier);
        }

        if let Err(e) = self.store_dependencies() {
            failure.get_or_insert(e);
        }
        self.store_constructions();
        self.store_failure(failure);
        self.core.state
    }

    fn changed(&self) -> bool {
        self.written
            .iter()
            .any(|(o, p)| self.core.state.value(*o, *p) != self.core.pre.value(*o, *p))
    }

    fn rollback(&mut self) {
        let (target, id) = (self.core.target, self.observer.id);
        let queue: Vec<(Slot, Option<Cell>)> = Priority::ALL
            .iter()
            .map(|p| {
                let slot = Slot::Queue(*p);
                (slot, self.core.state.cell(ObjectId::UNIVERSE, slot).cloned())
            })
            .collect();
        self.core.state = self.core.pre.clone();
        // Triggers survive the rollback; writes do not.
        for (slot, cell) in queue {
            self.core.state.put(ObjectId::UNIVERSE, slot, cell);
        }
        self.constructions = self.core.pre.constructed(target, id).as_ref().clone();
        self.written.clear();
        self.writes.clear();
    }

    fn check_observed(&self) -> EngineResult<()> {
        let count: usize = self.observeds.values().map(BTreeSet::len).sum();
        let limit = self.core.shared.config.max_nr_of_observed;
        if count > limit {
            return Err(EngineError::TooManyObserved {
                object: self.core.target,
                observer: self.observer.name.to_string(),
                count,
                limit,
            });
        }
        Ok(())
    }

    fn count_change(&mut self) -> EngineResult<()> {
        let shared = self.core.shared;
        let (target, observer) = (self.core.target, self.observer);
        let config = &shared.config;
        let (count, total) = shared.stats.count_change(target, observer.id);
        if count > config.max_nr_of_changes || total > config.max_total_nr_of_changes {
            shared.stats.start_debugging(target, &observer.name, count);
        }
        if !shared.stats.debugging() {
            return Ok(());
        }
        let trace = self.record_trace(count);
        if count > config.max_nr_of_changes + TRACE_DEPTH
            || total > config.max_total_nr_of_changes.saturating_mul(2)
        {
            return Err(EngineError::TooManyChanges {
                object: target,
                observer: observer.name.to_string(),
                count,
                trace: trace.render(TRACE_DEPTH as usize),
            });
        }
        Ok(())
    }

    fn record_trace(&self, count: u32) -> Arc<ObserverTrace> {
        let shared = self.core.shared;
        let traced = |values: &[(ObjectId, PropertyId, Value)]| -> Vec<TracedValue> {
            values
                .iter()
                .map(|(object, property, value)| TracedValue {
                    object: *object,
                    property: shared
                        .registry
                        .property(*property)
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|_| Arc::from("?")),
                    value: value.clone(),
                })
                .collect()
        };
        let keys = |values: &[(ObjectId, PropertyId, Value)]| -> Vec<(ObjectId, PropertyId)> {
            values.iter().map(|(o, p, _)| (*o, *p)).collect()
        };
        let trace = Arc::new(ObserverTrace {
            object: self.core.target,
            observer: self.observer.name.clone(),
            count,
            reads: traced(&self.reads),
            writes: traced(&self.writes),
            cause: shared.stats.last_writer(&keys(&self.reads)),
        });
        shared.stats.record_writes(&keys(&self.writes), &trace);
        trace
    }

    /// Replace the dependency set and patch the reverse reader index.
    fn store_dependencies(&mut self) -> EngineResult<()> {
        let shared = self.core.shared;
        let (target, id) = (self.core.target, self.observer.id);
        let direction = self.observer.direction;
        let old = self.core.state.dependencies(target, id);
        let new = std::mem::take(&mut self.observeds);
        if *old == new {
            return Ok(());
        }
        let reader = Reader {
            target,
            observer: id,
        };
        let holds = |deps: &Dependencies, p: &PropertyId, o: &Observee| {
            deps.get(p).is_some_and(|set| set.contains(o))
        };

        for (property, observees) in old.iter() {
            for observee in observees {
                if !holds(&new, property, observee) {
                    self.core
                        .update_readers(observee.resolve(target), *property, direction, reader, false);
                }
            }
        }
        let mut result = Ok(());
        let limit = shared.config.max_nr_of_observers;
        for (property, observees) in &new {
            for observee in observees {
                if holds(old.as_ref(), property, observee) {
                    continue;
                }
                let object = observee.resolve(target);
                let count = self
                    .core
                    .update_readers(object, *property, direction, reader, true);
                if count > limit && result.is_ok() {
                    result = Err(EngineError::TooManyObservers {
                        object,
                        property: self.property_name(*property),
                        count,
                        limit,
                    });
                }
            }
        }

        match (old.is_empty(), new.is_empty()) {
            (true, false) => shared.stats.instance_added(),
            (false, true) => shared.stats.instance_removed(),
            _ => {}
        }
        let cell = (!new.is_empty()).then(|| Cell::Dependencies(Arc::new(new)));
        self.core.state.put(target, Slot::Dependencies(id), cell);
        result
    }

    /// Replace the constructed map, dropping derivations no longer made.
    fn store_constructions(&mut self) {
        let (target, id) = (self.core.target, self.observer.id);
        let old = self.core.state.constructed(target, id);
        if *old == self.constructions {
            return;
        }
        for (reason, object) in old.iter() {
            if self.constructions.get(reason) == Some(object) {
                continue;
            }
            let stale = Construction::derived(target, id, reason.clone());
            let mut derivations = self.core.state.derivations(*object).as_ref().clone();
            if derivations.remove(&stale) {
                let cell = (!derivations.is_empty()).then(|| Cell::Constructions(Arc::new(derivations)));
                self.core.state.put(*object, Slot::Derivations, cell);
            }
        }
        let cell = (!self.constructions.is_empty())
            .then(|| Cell::Constructed(Arc::new(self.constructions.clone())));
        self.core.state.put(target, Slot::Constructed(id), cell);
    }

    fn store_failure(&mut self, failure: Option<EngineError>) {
        let (target, id) = (self.core.target, self.observer.id);
        match failure {
            Some(error) => {
                if error.is_consistency() {
                    warn!(object = %target, observer = %self.observer.name, %error, "observer_stopped");
                    self.core.shared.stopped.insert((target, id));
                } else {
                    debug!(object = %target, observer = %self.observer.name, %error, "observer_failed");
                }
                self.core
                    .state
                    .put(target, Slot::Exception(id), Some(Cell::Failure(Arc::new(error))));
            }
            None => {
                if self.core.state.exception(target, id).is_some() {
                    self.core.state.put(target, Slot::Exception(id), None);
                }
            }
        }
    }

    fn property_name(&self, property: PropertyId) -> String {
        self.core
            .property(property)
            .map(|p| p.name.to_string())
            .unwrap_or_else(|_| property.to_string())
    }

    fn observe(&mut self, object: ObjectId, property: PropertyId) {
        self.observeds
            .entry(property)
            .or_default()
            .insert(Observee::of(object, self.core.target));
    }

    /// Record that a write was deferred to `tier`; the most urgent tier wins.
    pub(crate) fn defer_to(&mut self, tier: Priority) {
        self.defer = Some(self.defer.map_or(tier, |current| current.min(tier)));
    }

    /// Follow replacement links of a detached object.
    pub(crate) fn survivor(&self, object: ObjectId) -> ObjectId {
        let state = &self.core.state;
        let mut current = object;
        for _ in 0..=state.object_count() {
            match state.replacing(current) {
                Some(next) if state.parent(current).is_none() => current = next,
                _ => break,
            }
        }
        current
    }

    fn constant(&mut self, object: ObjectId, spec: &PropertySpec) -> EngineResult<Value> {
        let shared = self.core.shared;
        if let Some(v) = shared.constants.get(&(object, spec.id)) {
            return Ok(v.value().clone());
        }
        let deriver = spec
            .deriver()
            .cloned()
            .ok_or_else(|| EngineError::failed(format!("constant {} has no deriver", spec.name)))?;
        self.initializing.push((object, spec.id));
        let result = deriver(self, object);
        self.initializing.pop();
        let value = result?;
        shared.constants.insert((object, spec.id), value.clone());
        Ok(value)
    }

    /// Match newables and ripple out a write to an observed property.
    fn settle_value(
        &mut self,
        object: ObjectId,
        spec: &PropertySpec,
        current: &Value,
        value: Value,
    ) -> EngineResult<Value> {
        let shared = self.core.shared;
        let has_newable =
            |v: &Value| v.objects().iter().any(|o| shared.newable(*o).is_some());
        if !has_newable(current) && !has_newable(&value) {
            return Ok(self.ripple_out(object, spec, current, value));
        }
        let matched = if current.is_collection() || value.is_collection() {
            self.many_match(object, spec, current, value)?
        } else {
            self.single_match(current, value)?
        };
        if matched == *current {
            return Ok(matched);
        }
        Ok(self.ripple_out(object, spec, current, matched))
    }

    fn history_candidate(&self, reason: &Reason, class: ClassId) -> Option<ObjectId> {
        let (target, id) = (self.core.target, self.observer.id);
        let state = &self.core.state;
        self.core.snapshots.history.iter().find_map(|past| {
            let found = past.constructed(target, id).get(reason).copied()?;
            let reusable = self.core.shared.objects.class_of(found) == Some(class)
                && state.parent(found).is_none()
                && !state.derivations(found).iter().any(Construction::is_derived);
            reusable.then_some(found)
        })
    }
}

impl Transaction for ObserverTransaction<'_> {
    fn kind(&self) -> TransactionKind {
        TransactionKind::Observer
    }

    fn target(&self) -> ObjectId {
        self.core.target
    }

    fn direction(&self) -> Direction {
        self.observer.direction
    }
}

impl Leaf for ObserverTransaction<'_> {
    fn target(&self) -> ObjectId {
        self.core.target
    }

    fn get(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<Value> {
        let spec = self.core.property(property)?;
        if spec.is_constant() {
            return self.constant(object, spec);
        }
        let object = self.survivor(object);
        if spec.is_observed() {
            if let Some((constant_object, constant)) = self.initializing.last().copied() {
                return Err(EngineError::NonDeterministic {
                    object,
                    property: spec.name.to_string(),
                    constant: format!("{constant_object}.{}", self.property_name(constant)),
                });
            }
            self.observe(object, property);
        }
        let value = self.core.state.get(object, spec);
        if spec.mandatory && value.is_empty() {
            self.empty_mandatory = true;
        }
        if self.debugging && spec.is_observed() {
            self.reads.push((object, property, value.clone()));
        }
        Ok(value)
    }

    fn pre(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<Value> {
        self.core.pre_value(object, property)
    }

    fn set(&mut self, object: ObjectId, property: PropertyId, value: Value) -> EngineResult<()> {
        let spec = self.core.property(property)?;
        let current = self.core.state.get(object, spec);
        if current == value {
            if spec.is_observed() {
                self.observe(object, property);
            }
            return Ok(());
        }
        let value = if spec.is_observed() {
            if spec.mandatory && !spec.plumbing && value.is_empty() && self.empty_mandatory {
                return Err(EngineError::EmptyMandatory {
                    object,
                    property: spec.name.to_string(),
                });
            }
            self.observe(object, property);
            self.written.insert((object, property));
            if spec.plumbing {
                value
            } else {
                self.settle_value(object, spec, &current, value)?
            }
        } else {
            value
        };
        if value == current {
            return Ok(());
        }
        let old = self.core.write(object, property, value.clone())?;
        if self.debugging {
            self.writes.push((object, property, value.clone()));
        }
        if let Some(hook) = spec.change_hook().cloned() {
            hook(self, object, &old, &value)?;
        }
        Ok(())
    }

    /// Memoized per (object, observer, reason); reuses a detached object
    /// from history before allocating a new one.
    fn construct(&mut self, reason: Reason, class: ClassId) -> EngineResult<ObjectId> {
        if let Some(found) = self.constructions.get(&reason) {
            return Ok(*found);
        }
        let shared = self.core.shared;
        let (target, id) = (self.core.target, self.observer.id);
        let construction = Construction::derived(target, id, reason.clone());
        let existing = self
            .core
            .state
            .constructed(target, id)
            .get(&reason)
            .copied()
            .map(|o| self.survivor(o));

        let result = match existing.or_else(|| self.history_candidate(&reason, class)) {
            Some(found) => found,
            None => {
                shared.registry.class(class)?;
                shared.objects.allocate_derived(class, &construction)
            }
        };
        if self.core.state.initial_construction(result).is_none() {
            self.core.state.put(
                result,
                Slot::InitialConstruction,
                Some(Cell::Construction(Arc::new(construction.clone()))),
            );
        }
        let mut derivations = self.core.state.derivations(result).as_ref().clone();
        if derivations.insert(construction) {
            self.core
                .state
                .put(result, Slot::Derivations, Some(Cell::Constructions(Arc::new(derivations))));
        }
        self.constructions.insert(reason, result);
        Ok(result)
    }

    fn trigger(&mut self, object: ObjectId, observer: ObserverId, priority: Priority) -> EngineResult<()> {
        self.core.trigger(object, observer, priority);
        Ok(())
    }

    fn parent(&mut self, object: ObjectId) -> Option<(ObjectId, PropertyId)> {
        self.core.parent(object)
    }

    fn class_of(&self, object: ObjectId) -> Option<ClassId> {
        self.core.shared.objects.class_of(object)
    }
}

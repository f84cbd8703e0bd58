//! Write path shared by action and observer transactions.

use std::collections::BTreeSet;
use std::sync::Arc;

use cascade_core::{
    Cell, ClassId, Construction, Containing, Direction, EngineError, EngineResult, LeafRef,
    ObjectId, ObserverId, Priority, PropertyId, PropertySpec, Queued, Reader, Reason, Slot, State,
    Value,
};

use super::enqueue;
use crate::context::{Shared, Snapshots};

/// State and bookkeeping of one running leaf.
pub(crate) struct LeafCore<'a> {
    pub shared: &'a Shared,
    pub snapshots: &'a Snapshots,
    /// State the leaf started from.
    pub pre: State,
    /// Working state, including the leaf's own writes.
    pub state: State,
    pub target: ObjectId,
    pub leaf: LeafRef,
}

impl<'a> LeafCore<'a> {
    pub fn new(shared: &'a Shared, snapshots: &'a Snapshots, state: &State, queued: Queued) -> Self {
        Self {
            shared,
            snapshots,
            pre: state.clone(),
            state: state.clone(),
            target: queued.target,
            leaf: queued.leaf,
        }
    }

    pub fn property(&self, property: PropertyId) -> EngineResult<&'a PropertySpec> {
        self.shared.registry.property(property)
    }

    pub fn value(&self, object: ObjectId, property: PropertyId) -> EngineResult<Value> {
        Ok(self.state.get(object, self.property(property)?))
    }

    pub fn pre_value(&self, object: ObjectId, property: PropertyId) -> EngineResult<Value> {
        Ok(self.pre.get(object, self.property(property)?))
    }

    pub fn parent(&self, object: ObjectId) -> Option<(ObjectId, PropertyId)> {
        self.state.parent(object).map(|c| (c.parent, c.property))
    }

    /// Store a value and do the bookkeeping that follows from it.
    ///
    /// Returns the previous value. Equal values are a no-op.
    pub fn write(&mut self, object: ObjectId, property: PropertyId, value: Value) -> EngineResult<Value> {
        let spec = self.property(property)?;
        if spec.is_constant() {
            return Err(EngineError::failed(format!(
                "constant {} cannot be set",
                spec.name
            )));
        }
        let old = self.state.set_value(object, spec, value.clone());
        if old == value {
            return Ok(old);
        }
        if !spec.plumbing {
            self.mark_changed(object);
        }
        if spec.containment {
            self.update_containment(object, spec, &old, &value)?;
        }
        if spec.is_observed() {
            self.trigger_readers(object, property);
        }
        Ok(old)
    }

    /// Stamp the current transaction id on `object` and its ancestors.
    fn mark_changed(&mut self, object: ObjectId) {
        let id = self.state.transaction_id();
        let mut current = object;
        for _ in 0..=self.state.object_count() {
            if current.is_universe() || self.state.change_id(current) == id {
                return;
            }
            self.state.put(current, Slot::ChangeId, Some(Cell::Counter(id)));
            match self.state.parent(current) {
                Some(c) => current = c.parent,
                None => return,
            }
        }
    }

    fn update_containment(
        &mut self,
        object: ObjectId,
        spec: &PropertySpec,
        old: &Value,
        new: &Value,
    ) -> EngineResult<()> {
        let here = Containing {
            parent: object,
            property: spec.id,
        };
        let before: BTreeSet<ObjectId> = old.objects().into_iter().collect();
        let after: BTreeSet<ObjectId> = new.objects().into_iter().collect();

        for child in before.difference(&after) {
            if self.state.parent(*child) == Some(here) {
                self.state.put(*child, Slot::Parent, None);
            }
        }
        for child in after.difference(&before) {
            if let Some(previous) = self.state.parent(*child) {
                if previous != here {
                    // Moving a child detaches it from its old holder first.
                    let holder = self.property(previous.property)?;
                    let remaining = self
                        .state
                        .get(previous.parent, holder)
                        .without(&Value::Object(*child));
                    self.write(previous.parent, previous.property, remaining)?;
                }
            }
            self.state.put(*child, Slot::Parent, Some(Cell::Parent(here)));
            self.activate(*child)?;
        }
        Ok(())
    }

    /// Start an object's observers, and those of its contained children.
    pub fn activate(&mut self, object: ObjectId) -> EngineResult<()> {
        if self.state.is_active(object) {
            return Ok(());
        }
        self.state.put(object, Slot::Active, Some(Cell::Flag));
        let shared = self.shared;
        let registry = &shared.registry;
        let class = shared.class(object)?;
        for id in &class.observers {
            let observer = registry.observer(*id)?;
            self.trigger(object, *id, observer.priority);
        }
        for spec in registry.containments(class.id) {
            let here = Containing {
                parent: object,
                property: spec.id,
            };
            for child in self.state.get(object, spec).objects() {
                if self.state.parent(child) == Some(here) {
                    self.activate(child)?;
                }
            }
        }
        Ok(())
    }

    pub fn trigger(&mut self, object: ObjectId, observer: ObserverId, tier: Priority) {
        enqueue(&mut self.state, Queued::observer(object, observer), tier);
    }

    /// Queue every observer that read `property` of `object`, except the
    /// leaf doing the write.
    pub fn trigger_readers(&mut self, object: ObjectId, property: PropertyId) {
        for direction in [Direction::Forward, Direction::Backward] {
            let readers = self.state.readers(object, property, direction);
            for reader in readers.iter() {
                if self.is_self(reader) {
                    continue;
                }
                self.trigger(reader.target, reader.observer, direction.priority());
            }
        }
    }

    fn is_self(&self, reader: &Reader) -> bool {
        reader.target == self.target && self.leaf == LeafRef::Observer(reader.observer)
    }

    /// Allocate an object that carries a direct construction.
    pub fn construct_direct(&mut self, reason: Reason, class: ClassId) -> EngineResult<ObjectId> {
        self.shared.registry.class(class)?;
        let id = self.shared.objects.allocate(class, None);
        let construction = Arc::new(Construction::direct(reason));
        self.state.put(
            id,
            Slot::Derivations,
            Some(Cell::Constructions(Arc::new(
                [construction.as_ref().clone()].into(),
            ))),
        );
        self.state
            .put(id, Slot::InitialConstruction, Some(Cell::Construction(construction)));
        Ok(id)
    }

    /// Add or remove a reader in the reverse index of `(object, property)`.
    ///
    /// Returns the number of readers afterwards.
    pub fn update_readers(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        direction: Direction,
        reader: Reader,
        add: bool,
    ) -> usize {
        let mut readers = self.state.readers(object, property, direction).as_ref().clone();
        let changed = if add {
            readers.insert(reader)
        } else {
            readers.remove(&reader)
        };
        let count = readers.len();
        if changed {
            let cell = (!readers.is_empty()).then(|| Cell::Readers(Arc::new(readers)));
            self.state.put(object, Slot::Readers(property, direction), cell);
        }
        count
    }
}

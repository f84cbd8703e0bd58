//! Read-only "what would it be" evaluation.
//!
//! A derivation transaction answers what an observed property would hold if
//! the observers declared as computing it ran now, without committing
//! anything. Writes go into a local memo; nothing reaches the state.

use std::collections::{BTreeMap, BTreeSet};

use cascade_core::{
    ClassId, EngineError, EngineResult, Leaf, ObjectId, ObserverId, Priority, PropertyId, Reason,
    State, Value,
};
use tracing::debug;

use super::{Transaction, TransactionKind};
use crate::context::Shared;

/// Outcome of a derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derivation {
    /// Computed by a deriving observer.
    Derived(Value),
    /// No observer computes the property; the stored value.
    NotDerived(Value),
    /// The property was already being derived; the stored value.
    Recursive(Value),
}

impl Derivation {
    pub fn value(&self) -> &Value {
        match self {
            Derivation::Derived(v) | Derivation::NotDerived(v) | Derivation::Recursive(v) => v,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Derivation::Derived(v) | Derivation::NotDerived(v) | Derivation::Recursive(v) => v,
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self, Derivation::Derived(_))
    }
}

pub struct DerivationTransaction<'a> {
    shared: &'a Shared,
    state: &'a State,
    target: ObjectId,
    observer: Option<ObserverId>,
    memo: BTreeMap<(ObjectId, PropertyId), Value>,
    deriving: BTreeSet<(ObjectId, PropertyId)>,
    kind: TransactionKind,
}

impl<'a> DerivationTransaction<'a> {
    pub(crate) fn new(shared: &'a Shared, state: &'a State, target: ObjectId) -> Self {
        Self {
            shared,
            state,
            target,
            observer: None,
            memo: BTreeMap::new(),
            deriving: BTreeSet::new(),
            kind: TransactionKind::Derivation,
        }
    }

    pub fn derive(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<Derivation> {
        if let Some(v) = self.memo.get(&(object, property)) {
            return Ok(Derivation::Derived(v.clone()));
        }
        let shared = self.shared;
        let spec = shared.registry.property(property)?;
        let stored = self.state.get(object, spec);
        if !self.deriving.insert((object, property)) {
            return Ok(Derivation::Recursive(stored));
        }
        let derivers = match shared.objects.class_of(object) {
            Some(class) => shared.registry.derivers(class, property),
            None => Vec::new(),
        };
        let (target, observer) = (self.target, self.observer);
        self.target = object;
        for deriver in &derivers {
            self.observer = Some(deriver.id);
            if let Err(e) = deriver.run(self) {
                if shared.config.trace_derivation {
                    debug!(%object, observer = %deriver.name, error = %e, "derivation_failed");
                }
            }
        }
        self.target = target;
        self.observer = observer;
        self.deriving.remove(&(object, property));

        let result = match self.memo.get(&(object, property)) {
            Some(v) => Derivation::Derived(v.clone()),
            None if derivers.is_empty() => Derivation::NotDerived(stored),
            // Derivers ran without writing the property, so it would keep its value.
            None => Derivation::Derived(stored),
        };
        if shared.config.trace_derivation {
            debug!(%object, property = %spec.name, value = %result.value(), "derived");
        }
        Ok(result)
    }

    /// Matching identity of a newable, or `None` when it has none.
    pub(crate) fn identity(shared: &'a Shared, state: &'a State, object: ObjectId) -> EngineResult<Option<Value>> {
        let Some(identity) = shared.newable(object).and_then(|n| n.identity()).cloned() else {
            return Ok(None);
        };
        let mut tx = DerivationTransaction::new(shared, state, object);
        tx.kind = TransactionKind::Identity;
        let value = identity(&mut tx, object)?;
        Ok((!value.is_empty()).then_some(value))
    }
}

impl Transaction for DerivationTransaction<'_> {
    fn kind(&self) -> TransactionKind {
        self.kind
    }

    fn target(&self) -> ObjectId {
        self.target
    }
}

impl Leaf for DerivationTransaction<'_> {
    fn target(&self) -> ObjectId {
        self.target
    }

    fn get(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<Value> {
        let shared = self.shared;
        let spec = shared.registry.property(property)?;
        if spec.is_constant() {
            if let Some(v) = shared.constants.get(&(object, property)) {
                return Ok(v.value().clone());
            }
            let deriver = spec
                .deriver()
                .cloned()
                .ok_or_else(|| EngineError::failed(format!("constant {} has no deriver", spec.name)))?;
            return deriver(self, object);
        }
        if spec.is_observed() {
            return Ok(self.derive(object, property)?.into_value());
        }
        Ok(self
            .memo
            .get(&(object, property))
            .cloned()
            .unwrap_or_else(|| self.state.get(object, spec)))
    }

    fn pre(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<Value> {
        let spec = self.shared.registry.property(property)?;
        Ok(self.state.get(object, spec))
    }

    fn set(&mut self, object: ObjectId, property: PropertyId, value: Value) -> EngineResult<()> {
        self.memo.insert((object, property), value);
        Ok(())
    }

    /// Only objects the running deriver already constructed are visible.
    fn construct(&mut self, reason: Reason, _class: ClassId) -> EngineResult<ObjectId> {
        let observer = self
            .observer
            .ok_or_else(|| EngineError::failed("construct outside a deriver"))?;
        self.state
            .constructed(self.target, observer)
            .get(&reason)
            .copied()
            .ok_or_else(|| EngineError::failed(format!("{reason} not constructed yet")))
    }

    fn trigger(&mut self, _object: ObjectId, _observer: ObserverId, _priority: Priority) -> EngineResult<()> {
        Ok(())
    }

    fn parent(&mut self, object: ObjectId) -> Option<(ObjectId, PropertyId)> {
        self.state.parent(object).map(|c| (c.parent, c.property))
    }

    fn class_of(&self, object: ObjectId) -> Option<ClassId> {
        self.shared.objects.class_of(object)
    }
}

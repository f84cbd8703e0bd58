//! Actions: externally submitted writes.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use cascade_core::{
    ActionId, Cell, ClassId, EngineError, EngineResult, Leaf, ObjectId, ObserverId, Priority,
    PropertyId, PropertySpec, Queued, Reason, Slot, State, Value,
};
use tracing::debug;

use super::leaf::LeafCore;
use super::{panic_message, Transaction, TransactionKind};
use crate::context::{Shared, Snapshots};

/// Body of a user action.
pub type ActionFn = Arc<dyn Fn(&mut dyn Leaf) -> EngineResult<()> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum ActionBody {
    /// Activates the universe, then runs the optional body.
    Init(Option<ActionFn>),
    Run(ActionFn),
    /// Values an imperative bridge set, tagged with its change counter.
    Imperative {
        index: u32,
        change_nr: u64,
        values: Arc<Vec<(ObjectId, PropertyId, Value)>>,
    },
    /// Step back in the history.
    Backward,
    /// Step forward in the history.
    Forward,
    /// Push the current state to the imperative bridges.
    Commit,
    Stop,
}

/// A unit of work submitted to the universe queue.
#[derive(Clone)]
pub struct Action {
    pub id: ActionId,
    pub name: Arc<str>,
    pub(crate) body: ActionBody,
}

impl Action {
    pub(crate) fn new(id: ActionId, name: &str, body: ActionBody) -> Self {
        Self {
            id,
            name: Arc::from(name),
            body,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Leaf running an action body. Reads are not tracked.
pub struct ActionTransaction<'a> {
    core: LeafCore<'a>,
}

impl<'a> ActionTransaction<'a> {
    /// Run the action queued as `queued` and return the resulting state.
    ///
    /// Failures are fatal to the engine.
    pub(crate) fn run(shared: &'a Shared, snapshots: &'a Snapshots, state: &State, queued: Queued, id: ActionId) -> State {
        let Some(action) = shared.actions.get(&id).map(|a| a.value().clone()) else {
            return state.clone();
        };
        let _guard = match shared.pool.open(TransactionKind::Action, queued) {
            Ok(guard) => guard,
            Err(e) => {
                shared.fail(e);
                return state.clone();
            }
        };
        shared.stats.count_leaf();
        if shared.config.trace_actions {
            debug!(action = %action.name, id = %action.id, "action_run");
        }

        let mut tx = ActionTransaction {
            core: LeafCore::new(shared, snapshots, state, queued),
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| tx.execute(&action.body)))
            .unwrap_or_else(|payload| Err(EngineError::failed(panic_message(payload))));
        match outcome {
            Ok(()) => tx.core.state,
            Err(e) => {
                shared.fail(EngineError::ActionFailed {
                    action: action.name.to_string(),
                    message: e.to_string(),
                });
                state.clone()
            }
        }
    }

    fn execute(&mut self, body: &ActionBody) -> EngineResult<()> {
        match body {
            ActionBody::Init(run) => {
                self.core.activate(ObjectId::UNIVERSE)?;
                match run {
                    Some(run) => run(self),
                    None => Ok(()),
                }
            }
            ActionBody::Run(run) => run(self),
            ActionBody::Imperative {
                index,
                change_nr,
                values,
            } => {
                for (object, property, value) in values.iter() {
                    self.set(*object, *property, value.clone())?;
                }
                self.core.state.put(
                    ObjectId::UNIVERSE,
                    Slot::Absorbed(*index),
                    Some(Cell::Counter(*change_nr)),
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn constant(&mut self, object: ObjectId, spec: &PropertySpec) -> EngineResult<Value> {
        if let Some(v) = self.core.shared.constants.get(&(object, spec.id)) {
            return Ok(v.value().clone());
        }
        let deriver = spec
            .deriver()
            .cloned()
            .ok_or_else(|| EngineError::failed(format!("constant {} has no deriver", spec.name)))?;
        let value = deriver(self, object)?;
        self.core
            .shared
            .constants
            .insert((object, spec.id), value.clone());
        Ok(value)
    }
}

impl Transaction for ActionTransaction<'_> {
    fn kind(&self) -> TransactionKind {
        TransactionKind::Action
    }

    fn target(&self) -> ObjectId {
        self.core.target
    }
}

impl Leaf for ActionTransaction<'_> {
    fn target(&self) -> ObjectId {
        self.core.target
    }

    fn get(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<Value> {
        let spec = self.core.property(property)?;
        if spec.is_constant() {
            return self.constant(object, spec);
        }
        self.core.value(object, property)
    }

    fn pre(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<Value> {
        self.core.pre_value(object, property)
    }

    fn set(&mut self, object: ObjectId, property: PropertyId, value: Value) -> EngineResult<()> {
        let spec = self.core.property(property)?;
        let old = self.core.write(object, property, value.clone())?;
        if old != value {
            if let Some(hook) = spec.change_hook().cloned() {
                hook(self, object, &old, &value)?;
            }
        }
        Ok(())
    }

    fn construct(&mut self, reason: Reason, class: ClassId) -> EngineResult<ObjectId> {
        self.core.construct_direct(reason, class)
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

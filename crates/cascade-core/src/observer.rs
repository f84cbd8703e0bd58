//! Observer abstractions.
//!
//! Observers are declarative functions. The engine re-runs an observer on an
//! object whenever an observed value it read during its previous run changes.

use std::fmt;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::ids::{ClassId, ObserverId, PropertyId};
use crate::leaf::Leaf;
use crate::priority::{Direction, Priority};

/// A declarative rule evaluated per object.
pub trait Observer: Send + Sync {
    fn name(&self) -> &str;

    /// Evaluate against the running transaction.
    fn run(&self, tx: &mut dyn Leaf) -> EngineResult<()>;
}

/// Observer backed by a closure.
pub struct FnObserver<F> {
    name: String,
    body: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&mut dyn Leaf) -> EngineResult<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl<F> Observer for FnObserver<F>
where
    F: Fn(&mut dyn Leaf) -> EngineResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, tx: &mut dyn Leaf) -> EngineResult<()> {
        (self.body)(tx)
    }
}

/// Registration record of an observer.
#[derive(Clone)]
pub struct ObserverSpec {
    /// Assigned on registration.
    pub id: ObserverId,
    /// Assigned on registration.
    pub class: ClassId,
    pub name: Arc<str>,
    pub direction: Direction,
    /// Tier of the first run after activation.
    pub priority: Priority,
    /// Roll back all writes of a run that had to be deferred.
    pub atomic: bool,
    /// Whether failures of this observer count in the consistency check.
    pub checking: bool,
    /// Properties this observer computes; used by derivation lookups.
    pub targets: Vec<PropertyId>,
    body: Arc<dyn Observer>,
}

impl ObserverSpec {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&mut dyn Leaf) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self::from_observer(Arc::new(FnObserver::new(name, body)))
    }

    pub fn from_observer(body: Arc<dyn Observer>) -> Self {
        Self {
            id: ObserverId(u32::MAX),
            class: ClassId(u32::MAX),
            name: Arc::from(body.name()),
            direction: Direction::Forward,
            priority: Priority::One,
            atomic: false,
            checking: true,
            targets: Vec::new(),
            body,
        }
    }

    pub fn backward(mut self) -> Self {
        self.direction = Direction::Backward;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn non_checking(mut self) -> Self {
        self.checking = false;
        self
    }

    /// Declare the properties this observer computes.
    pub fn deriving(mut self, targets: impl IntoIterator<Item = PropertyId>) -> Self {
        self.targets.extend(targets);
        self
    }

    pub fn run(&self, tx: &mut dyn Leaf) -> EngineResult<()> {
        self.body.run(tx)
    }
}

impl fmt::Debug for ObserverSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSpec")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("priority", &self.priority)
            .field("atomic", &self.atomic)
            .field("targets", &self.targets)
            .finish()
    }
}

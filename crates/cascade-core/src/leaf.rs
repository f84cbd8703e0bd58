//! The interface observer and action bodies program against.

use crate::construction::Reason;
use crate::error::EngineResult;
use crate::ids::{ClassId, ObjectId, ObserverId, PropertyId};
use crate::priority::Priority;
use crate::value::Value;

/// A running unit of work.
///
/// Every read and write of user code goes through the leaf transaction it
/// runs in. Observer transactions record reads as dependencies; action
/// transactions do not. The trait is object safe so that the same body can
/// run inside an observer transaction or a read-only derivation.
pub trait Leaf {
    /// Object this leaf runs on.
    fn target(&self) -> ObjectId;

    /// Current value, or the property default.
    fn get(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<Value>;

    /// Value at the start of this leaf.
    fn pre(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<Value>;

    fn set(&mut self, object: ObjectId, property: PropertyId, value: Value) -> EngineResult<()>;

    /// Obtain the object constructed for `reason`.
    ///
    /// Observers get a memoized, derived object; actions get a fresh object
    /// carrying a direct construction.
    fn construct(&mut self, reason: Reason, class: ClassId) -> EngineResult<ObjectId>;

    fn trigger(
        &mut self,
        object: ObjectId,
        observer: ObserverId,
        priority: Priority,
    ) -> EngineResult<()>;

    /// Containing object and property.
    fn parent(&mut self, object: ObjectId) -> Option<(ObjectId, PropertyId)>;

    fn class_of(&self, object: ObjectId) -> Option<ClassId>;

    fn get_int(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<Option<i64>> {
        Ok(self.get(object, property)?.as_int())
    }

    /// Boolean value; null reads as false.
    fn get_bool(&mut self, object: ObjectId, property: PropertyId) -> EngineResult<bool> {
        Ok(self.get(object, property)?.as_bool().unwrap_or(false))
    }

    fn get_object(
        &mut self,
        object: ObjectId,
        property: PropertyId,
    ) -> EngineResult<Option<ObjectId>> {
        Ok(self.get(object, property)?.as_object())
    }

    /// Add an element to a collection property (a set when it is null).
    fn add(&mut self, object: ObjectId, property: PropertyId, element: Value) -> EngineResult<()> {
        let current = self.get(object, property)?;
        if current.contains(&element) {
            return Ok(());
        }
        let mut elements = current.elements();
        elements.push(element);
        let next = match current {
            Value::Null => Value::set(elements),
            other => other.with_elements(elements),
        };
        self.set(object, property, next)
    }

    fn remove(
        &mut self,
        object: ObjectId,
        property: PropertyId,
        element: &Value,
    ) -> EngineResult<()> {
        let current = self.get(object, property)?;
        if !current.contains(element) {
            return Ok(());
        }
        self.set(object, property, current.without(element))
    }
}

//! Property declarations.
//!
//! A property is declared once, registered with a
//! [`RegistryBuilder`](crate::RegistryBuilder), and referred to by its
//! [`PropertyId`] afterwards. Three kinds exist:
//!
//! - **Setable**: a plain stored slot.
//! - **Observed**: a stored slot whose readers are tracked; writing it
//!   re-triggers every observer that read it.
//! - **Constant**: computed once per object by a deriver and memoized.

use std::fmt;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::ids::{ObjectId, PropertyId};
use crate::leaf::Leaf;
use crate::value::Value;

/// Predicate run by the consistency check on every changed, rooted object.
pub type ConsistencyCheck = Arc<dyn Fn(ObjectId, &Value) -> Result<(), String> + Send + Sync>;

/// Hook run inside the writing transaction after a value changed.
///
/// Arguments are the object, the old value and the new value.
pub type ChangeHook =
    Arc<dyn Fn(&mut dyn Leaf, ObjectId, &Value, &Value) -> EngineResult<()> + Send + Sync>;

/// Computes a constant for an object.
pub type ConstantDeriver = Arc<dyn Fn(&mut dyn Leaf, ObjectId) -> EngineResult<Value> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Setable,
    Observed,
    Constant,
}

/// Metadata of a declared property.
#[derive(Clone)]
pub struct PropertySpec {
    /// Assigned on registration.
    pub id: PropertyId,
    pub name: Arc<str>,
    pub kind: PropertyKind,
    /// Value reported when the slot was never set. Collection-valued
    /// properties default to an empty collection.
    pub default: Value,
    /// Values held by this property are children of the holder.
    pub containment: bool,
    /// Must be non-empty on rooted objects after every cycle.
    pub mandatory: bool,
    /// Internal bookkeeping, excluded from consistency and export.
    pub plumbing: bool,
    /// Whether the consistency check looks at this property.
    pub check_consistency: bool,
    check: Option<ConsistencyCheck>,
    on_change: Option<ChangeHook>,
    deriver: Option<ConstantDeriver>,
}

impl PropertySpec {
    fn new(name: &str, kind: PropertyKind) -> Self {
        Self {
            id: PropertyId(u32::MAX),
            name: Arc::from(name),
            kind,
            default: Value::Null,
            containment: false,
            mandatory: false,
            plumbing: false,
            check_consistency: true,
            check: None,
            on_change: None,
            deriver: None,
        }
    }

    pub fn setable(name: &str) -> Self {
        Self::new(name, PropertyKind::Setable)
    }

    pub fn observed(name: &str) -> Self {
        Self::new(name, PropertyKind::Observed)
    }

    pub fn constant<F>(name: &str, deriver: F) -> Self
    where
        F: Fn(&mut dyn Leaf, ObjectId) -> EngineResult<Value> + Send + Sync + 'static,
    {
        Self {
            deriver: Some(Arc::new(deriver)),
            ..Self::new(name, PropertyKind::Constant)
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }

    pub fn containment(mut self) -> Self {
        self.containment = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn plumbing(mut self) -> Self {
        self.plumbing = true;
        self.check_consistency = false;
        self
    }

    pub fn unchecked(mut self) -> Self {
        self.check_consistency = false;
        self
    }

    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: Fn(ObjectId, &Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    pub fn on_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut dyn Leaf, ObjectId, &Value, &Value) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(hook));
        self
    }

    pub fn is_observed(&self) -> bool {
        self.kind == PropertyKind::Observed
    }

    pub fn is_constant(&self) -> bool {
        self.kind == PropertyKind::Constant
    }

    /// Run the declared predicate, if any.
    pub fn check(&self, object: ObjectId, value: &Value) -> Result<(), String> {
        match &self.check {
            Some(check) => check(object, value),
            None => Ok(()),
        }
    }

    pub fn change_hook(&self) -> Option<&ChangeHook> {
        self.on_change.as_ref()
    }

    pub fn deriver(&self) -> Option<&ConstantDeriver> {
        self.deriver.as_ref()
    }
}

impl fmt::Debug for PropertySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("containment", &self.containment)
            .field("mandatory", &self.mandatory)
            .field("plumbing", &self.plumbing)
            .field("has_check", &self.check.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let p = PropertySpec::observed("children")
            .containment()
            .with_default(Value::empty_set());
        assert!(p.is_observed());
        assert!(p.containment);
        assert_eq!(p.default, Value::empty_set());

        let q = PropertySpec::setable("cache").plumbing();
        assert!(q.plumbing);
        assert!(!q.check_consistency);
    }

    #[test]
    fn test_check_predicate() {
        let p = PropertySpec::observed("age").with_check(|_, v| match v.as_int() {
            Some(n) if n < 0 => Err("negative".to_string()),
            _ => Ok(()),
        });
        assert!(p.check(ObjectId(1), &Value::Int(3)).is_ok());
        assert_eq!(p.check(ObjectId(1), &Value::Int(-1)), Err("negative".to_string()));
    }
}

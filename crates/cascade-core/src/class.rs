//! Object classes.

use std::fmt;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::ids::{ClassId, ObjectId, ObserverId, PropertyId};
use crate::leaf::Leaf;
use crate::value::Value;

/// Computes the matching identity of a newable from its properties.
pub type IdentityFn = Arc<dyn Fn(&mut dyn Leaf, ObjectId) -> EngineResult<Value> + Send + Sync>;

/// Marks a class as newable: its instances are derived and reconciled.
#[derive(Clone)]
pub struct NewableSpec {
    /// Instances only match instances of the same type.
    pub type_name: Arc<str>,
    identity: Option<IdentityFn>,
}

impl NewableSpec {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: Arc::from(type_name),
            identity: None,
        }
    }

    pub fn with_identity<F>(mut self, identity: F) -> Self
    where
        F: Fn(&mut dyn Leaf, ObjectId) -> EngineResult<Value> + Send + Sync + 'static,
    {
        self.identity = Some(Arc::new(identity));
        self
    }

    pub fn identity(&self) -> Option<&IdentityFn> {
        self.identity.as_ref()
    }
}

impl fmt::Debug for NewableSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewableSpec")
            .field("type_name", &self.type_name)
            .field("has_identity", &self.identity.is_some())
            .finish()
    }
}

/// The set of properties and observers an object supports.
#[derive(Debug, Clone)]
pub struct ClassSpec {
    /// Assigned on registration.
    pub id: ClassId,
    pub name: Arc<str>,
    pub properties: Vec<PropertyId>,
    /// Filled in as observers are registered.
    pub observers: Vec<ObserverId>,
    pub newable: Option<NewableSpec>,
}

impl ClassSpec {
    pub fn new(name: &str) -> Self {
        Self {
            id: ClassId(u32::MAX),
            name: Arc::from(name),
            properties: Vec::new(),
            observers: Vec::new(),
            newable: None,
        }
    }

    pub fn with_properties(mut self, properties: impl IntoIterator<Item = PropertyId>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn newable(mut self, newable: NewableSpec) -> Self {
        self.newable = Some(newable);
        self
    }

    pub fn is_newable(&self) -> bool {
        self.newable.is_some()
    }
}

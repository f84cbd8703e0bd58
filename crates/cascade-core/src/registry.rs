//! Startup-time registry of properties, classes and observers.
//!
//! All declarations are made once through a [`RegistryBuilder`]. The built
//! [`Registry`] is immutable and shared by every transaction, so lookups are
//! plain indexing.

use std::collections::HashMap;

use tracing::debug;

use crate::class::ClassSpec;
use crate::error::{EngineError, EngineResult};
use crate::ids::{ClassId, ObserverId, PropertyId};
use crate::observer::ObserverSpec;
use crate::property::PropertySpec;

/// Collects declarations before the engine starts.
#[derive(Debug)]
pub struct RegistryBuilder {
    properties: Vec<PropertySpec>,
    classes: Vec<ClassSpec>,
    observers: Vec<ObserverSpec>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a builder holding only the universe class.
    pub fn new() -> Self {
        let mut universe = ClassSpec::new("Universe");
        universe.id = ClassId::UNIVERSE;
        Self {
            properties: Vec::new(),
            classes: vec![universe],
            observers: Vec::new(),
        }
    }

    pub fn property(&mut self, mut spec: PropertySpec) -> PropertyId {
        let id = PropertyId(self.properties.len() as u32);
        spec.id = id;
        self.properties.push(spec);
        id
    }

    pub fn class(&mut self, mut spec: ClassSpec) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        spec.id = id;
        spec.observers.clear();
        self.classes.push(spec);
        id
    }

    /// Add properties to an already registered class.
    pub fn attach(
        &mut self,
        class: ClassId,
        properties: impl IntoIterator<Item = PropertyId>,
    ) -> EngineResult<()> {
        let spec = self
            .classes
            .get_mut(class.0 as usize)
            .ok_or(EngineError::UnknownClass(class))?;
        for p in properties {
            if !spec.properties.contains(&p) {
                spec.properties.push(p);
            }
        }
        Ok(())
    }

    pub fn observer(&mut self, class: ClassId, mut spec: ObserverSpec) -> EngineResult<ObserverId> {
        let id = ObserverId(self.observers.len() as u32);
        let class_spec = self
            .classes
            .get_mut(class.0 as usize)
            .ok_or(EngineError::UnknownClass(class))?;
        class_spec.observers.push(id);
        spec.id = id;
        spec.class = class;
        self.observers.push(spec);
        Ok(id)
    }

    /// Validate cross references and freeze the registry.
    pub fn build(self) -> EngineResult<Registry> {
        let known = |p: &PropertyId| (p.0 as usize) < self.properties.len();
        for class in &self.classes {
            if let Some(p) = class.properties.iter().find(|p| !known(p)) {
                return Err(EngineError::InvalidRegistry {
                    message: format!("class {} uses unknown property {p}", class.name),
                });
            }
        }

        let mut derivers: HashMap<PropertyId, Vec<ObserverId>> = HashMap::new();
        for observer in &self.observers {
            for target in &observer.targets {
                if !known(target) {
                    return Err(EngineError::InvalidRegistry {
                        message: format!("observer {} derives unknown property {target}", observer.name),
                    });
                }
                derivers.entry(*target).or_default().push(observer.id);
            }
        }

        for p in &self.properties {
            if p.is_constant() && p.deriver().is_none() {
                return Err(EngineError::InvalidRegistry {
                    message: format!("constant {} has no deriver", p.name),
                });
            }
        }

        debug!(
            properties = self.properties.len(),
            classes = self.classes.len(),
            observers = self.observers.len(),
            "registry_built"
        );

        Ok(Registry {
            properties: self.properties,
            classes: self.classes,
            observers: self.observers,
            derivers,
        })
    }
}

/// Frozen declarations shared by all transactions.
#[derive(Debug)]
pub struct Registry {
    properties: Vec<PropertySpec>,
    classes: Vec<ClassSpec>,
    observers: Vec<ObserverSpec>,
    derivers: HashMap<PropertyId, Vec<ObserverId>>,
}

impl Registry {
    pub fn property(&self, id: PropertyId) -> EngineResult<&PropertySpec> {
        self.properties
            .get(id.0 as usize)
            .ok_or(EngineError::UnknownProperty(id))
    }

    pub fn class(&self, id: ClassId) -> EngineResult<&ClassSpec> {
        self.classes
            .get(id.0 as usize)
            .ok_or(EngineError::UnknownClass(id))
    }

    pub fn observer(&self, id: ObserverId) -> EngineResult<&ObserverSpec> {
        self.observers
            .get(id.0 as usize)
            .ok_or(EngineError::UnknownObserver(id))
    }

    pub fn properties(&self) -> &[PropertySpec] {
        &self.properties
    }

    pub fn classes(&self) -> &[ClassSpec] {
        &self.classes
    }

    pub fn observers(&self) -> &[ObserverSpec] {
        &self.observers
    }

    /// Find a property by name.
    pub fn property_named(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| &*p.name == name)
    }

    /// Observers of `class` declared as computing `property`.
    pub fn derivers(&self, class: ClassId, property: PropertyId) -> Vec<&ObserverSpec> {
        self.derivers
            .get(&property)
            .into_iter()
            .flatten()
            .filter_map(|id| self.observers.get(id.0 as usize))
            .filter(|o| o.class == class)
            .collect()
    }

    /// Containment properties of a class.
    pub fn containments(&self, class: ClassId) -> Vec<&PropertySpec> {
        self.class(class)
            .map(|c| {
                c.properties
                    .iter()
                    .filter_map(|p| self.properties.get(p.0 as usize))
                    .filter(|p| p.containment)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf::Leaf;
    use crate::value::Value;

    #[test]
    fn test_build_assigns_ids() {
        let mut b = RegistryBuilder::new();
        let x = b.property(PropertySpec::observed("x"));
        let y = b.property(PropertySpec::observed("y"));
        let a = b.class(ClassSpec::new("A").with_properties([x, y]));
        let obs = b
            .observer(
                a,
                ObserverSpec::new("y", move |tx: &mut dyn Leaf| {
                    let t = tx.target();
                    let v = tx.get_int(t, x)?.unwrap_or(0);
                    tx.set(t, y, Value::Int(v + 1))
                })
                .deriving([y]),
            )
            .unwrap();
        let registry = b.build().unwrap();

        assert_eq!(registry.class(a).unwrap().observers, vec![obs]);
        assert_eq!(registry.observer(obs).unwrap().class, a);
        assert_eq!(registry.derivers(a, y).len(), 1);
        assert!(registry.derivers(ClassId::UNIVERSE, y).is_empty());
        assert_eq!(registry.property_named("x").map(|p| p.id), Some(x));
    }

    #[test]
    fn test_unknown_property_rejected() {
        let mut b = RegistryBuilder::new();
        b.class(ClassSpec::new("A").with_properties([PropertyId(9)]));
        assert!(matches!(b.build(), Err(EngineError::InvalidRegistry { .. })));
    }

    #[test]
    fn test_containments() {
        let mut b = RegistryBuilder::new();
        let kids = b.property(PropertySpec::observed("kids").containment());
        let name = b.property(PropertySpec::setable("name"));
        b.attach(ClassId::UNIVERSE, [kids, name]).unwrap();
        let registry = b.build().unwrap();
        let c = registry.containments(ClassId::UNIVERSE);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].id, kids);
    }
}

//! JSON rendering of a state.
//!
//! Objects render as maps with `"@id"` first and an optional `"name"`,
//! followed by their non-default, non-plumbing properties in name order.
//! Contained children are inlined; any other object reference becomes
//! `{"@idref": id}`.

use std::collections::BTreeSet;

use cascade_core::{Containing, ObjectId, PropertySpec, Registry, State, Value};
use serde_json::{json, Map};

use crate::objects::ObjectTable;

/// Written for references to objects the table does not know.
pub const NULL_REF: &str = "@@ERROR@NULL_REF@@";

pub struct StateJson<'a> {
    registry: &'a Registry,
    objects: &'a ObjectTable,
    state: &'a State,
}

impl<'a> StateJson<'a> {
    pub fn new(registry: &'a Registry, objects: &'a ObjectTable, state: &'a State) -> Self {
        Self {
            registry,
            objects,
            state,
        }
    }

    /// Render `root` and everything it contains.
    pub fn render(&self, root: ObjectId) -> serde_json::Value {
        self.object(root, &mut BTreeSet::new())
    }

    pub fn render_string(&self, root: ObjectId) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.render(root))
    }

    fn object(&self, object: ObjectId, visiting: &mut BTreeSet<ObjectId>) -> serde_json::Value {
        if !visiting.insert(object) {
            return reference(object);
        }
        let mut map = Map::new();
        map.insert("@id".into(), json!(object.to_string()));
        if let Some(name) = self.objects.name(object) {
            map.insert("name".into(), json!(&*name));
        }

        let mut properties: Vec<&PropertySpec> = self
            .objects
            .class_of(object)
            .and_then(|c| self.registry.class(c).ok())
            .map(|class| {
                class
                    .properties
                    .iter()
                    .filter_map(|p| self.registry.property(*p).ok())
                    .collect()
            })
            .unwrap_or_default();
        properties.sort_by(|a, b| a.name.cmp(&b.name));

        for spec in properties {
            if spec.plumbing || spec.is_constant() {
                continue;
            }
            let Some(value) = self.state.value(object, spec.id) else {
                continue;
            };
            if *value == spec.default {
                continue;
            }
            let here = Containing {
                parent: object,
                property: spec.id,
            };
            map.insert(spec.name.to_string(), self.value(value, spec.containment.then_some(here), visiting));
        }
        visiting.remove(&object);
        serde_json::Value::Object(map)
    }

    fn value(&self, value: &Value, here: Option<Containing>, visiting: &mut BTreeSet<ObjectId>) -> serde_json::Value {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Text(s) => json!(&**s),
            Value::Object(id) => {
                if here.is_some() && self.state.parent(*id) == here {
                    self.object(*id, visiting)
                } else if self.objects.contains(*id) {
                    reference(*id)
                } else {
                    json!(NULL_REF)
                }
            }
            Value::List(_) | Value::Set(_) => serde_json::Value::Array(
                value
                    .elements()
                    .iter()
                    .map(|e| self.value(e, here, visiting))
                    .collect(),
            ),
        }
    }
}

fn reference(object: ObjectId) -> serde_json::Value {
    json!({ "@idref": object.to_string() })
}

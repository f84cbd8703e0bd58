//! Property values.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::ids::ObjectId;

/// A property value stored in a [`State`](crate::State).
///
/// Collections are reference counted so cloning a value never copies its
/// elements. Equality is structural and drives all change detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Text(Arc<str>),
    /// Reference to (or, for containment properties, ownership of) an object.
    Object(ObjectId),
    List(Arc<Vec<Value>>),
    Set(Arc<BTreeSet<Value>>),
}

impl Value {
    /// Build a list value.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(Arc::new(items.into_iter().collect()))
    }

    /// Build a set value.
    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Set(Arc::new(items.into_iter().collect()))
    }

    /// An empty list.
    pub fn empty_list() -> Self {
        Value::List(Arc::new(Vec::new()))
    }

    /// An empty set.
    pub fn empty_set() -> Self {
        Value::Set(Arc::new(BTreeSet::new()))
    }

    /// Null or an empty collection.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::List(items) => items.is_empty(),
            Value::Set(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Value::List(_) | Value::Set(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    /// Elements of a collection; a scalar yields itself, null yields nothing.
    pub fn elements(&self) -> Vec<Value> {
        match self {
            Value::Null => Vec::new(),
            Value::List(items) => items.as_ref().clone(),
            Value::Set(items) => items.iter().cloned().collect(),
            other => vec![other.clone()],
        }
    }

    /// Check whether a collection (or scalar) holds `element`.
    pub fn contains(&self, element: &Value) -> bool {
        match self {
            Value::Null => false,
            Value::List(items) => items.contains(element),
            Value::Set(items) => items.contains(element),
            other => other == element,
        }
    }

    /// Objects directly held by this value.
    pub fn objects(&self) -> Vec<ObjectId> {
        match self {
            Value::Object(id) => vec![*id],
            Value::List(items) => items.iter().filter_map(Value::as_object).collect(),
            Value::Set(items) => items.iter().filter_map(Value::as_object).collect(),
            _ => Vec::new(),
        }
    }

    /// Rebuild a collection of the same kind from new elements.
    ///
    /// Scalars take the first element, or null when there is none.
    pub fn with_elements(&self, elements: Vec<Value>) -> Value {
        match self {
            Value::List(_) => Value::List(Arc::new(elements)),
            Value::Set(_) => Value::set(elements),
            _ => elements.into_iter().next().unwrap_or(Value::Null),
        }
    }

    /// Remove every occurrence of `element` from a collection, or null a
    /// matching scalar.
    pub fn without(&self, element: &Value) -> Value {
        match self {
            Value::List(items) => {
                Value::list(items.iter().filter(|e| *e != element).cloned())
            }
            Value::Set(items) => {
                let mut items = items.as_ref().clone();
                items.remove(element);
                Value::Set(Arc::new(items))
            }
            other if other == element => Value::Null,
            other => other.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Text(t) => write!(f, "{t:?}"),
            Value::Object(id) => write!(f, "#{id}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Set(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(Arc::from(s))
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Object(id)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

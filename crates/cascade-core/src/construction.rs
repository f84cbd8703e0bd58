//! Evidence records explaining why a newable object exists.
//!
//! A [`Reason`] is a value key naming *what* is constructed. A
//! [`Construction`] pairs it with *who* asked for it: an observer running on
//! an object (derived evidence), or nobody (direct evidence).

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::ids::{ObjectId, ObserverId};
use crate::value::Value;

/// One field of a reason.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReasonField {
    /// The object that constructs, whatever its id.
    This,
    Value(Value),
}

/// Value-typed key identifying what would be constructed.
///
/// References to the constructing object are stored as [`ReasonField::This`]
/// so the same reason compares equal across objects of the same shape.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reason {
    kind: Arc<str>,
    fields: Arc<[ReasonField]>,
}

impl Reason {
    /// Build a reason as seen from `this`.
    pub fn new(this: ObjectId, kind: &str, fields: impl IntoIterator<Item = Value>) -> Self {
        let fields = fields
            .into_iter()
            .map(|v| match v {
                Value::Object(id) if id == this => ReasonField::This,
                other => ReasonField::Value(other),
            })
            .collect();
        Self {
            kind: Arc::from(kind),
            fields,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[ReasonField] {
        &self.fields
    }

    /// Field `index` resolved against `this`.
    pub fn get(&self, this: ObjectId, index: usize) -> Option<Value> {
        self.fields.get(index).map(|f| match f {
            ReasonField::This => Value::Object(this),
            ReasonField::Value(v) => v.clone(),
        })
    }

    /// Objects referenced by the reason, with the self marker resolved.
    pub fn objects(&self, this: ObjectId) -> Vec<ObjectId> {
        self.fields
            .iter()
            .flat_map(|f| match f {
                ReasonField::This => vec![this],
                ReasonField::Value(v) => v.objects(),
            })
            .collect()
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match field {
                ReasonField::This => write!(f, "this")?,
                ReasonField::Value(v) => write!(f, "{v}")?,
            }
        }
        write!(f, ")")
    }
}

/// Who asked for a construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Origin {
    /// Explicitly supplied, typically by an action.
    Direct,
    /// Requested by `observer` while running on `object`.
    Derived {
        object: ObjectId,
        observer: ObserverId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Construction {
    pub origin: Origin,
    pub reason: Reason,
}

impl Construction {
    pub fn direct(reason: Reason) -> Self {
        Self {
            origin: Origin::Direct,
            reason,
        }
    }

    pub fn derived(object: ObjectId, observer: ObserverId, reason: Reason) -> Self {
        Self {
            origin: Origin::Derived { object, observer },
            reason,
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.origin, Origin::Derived { .. })
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.origin, Origin::Direct)
    }

    /// Deriving object, if any.
    pub fn object(&self) -> Option<ObjectId> {
        match self.origin {
            Origin::Derived { object, .. } => Some(object),
            Origin::Direct => None,
        }
    }

    pub fn observer(&self) -> Option<ObserverId> {
        match self.origin {
            Origin::Derived { observer, .. } => Some(observer),
            Origin::Direct => None,
        }
    }

    /// Objects this construction depends on: the deriving object and every
    /// object named in the reason.
    pub fn sources(&self) -> Vec<ObjectId> {
        match self.origin {
            Origin::Derived { object, .. } => {
                let mut sources = vec![object];
                for o in self.reason.objects(object) {
                    if !sources.contains(&o) {
                        sources.push(o);
                    }
                }
                sources
            }
            Origin::Direct => self.reason.objects(ObjectId::UNIVERSE),
        }
    }

    /// Hash used to derive a scheduling-independent object id.
    pub fn stable_hash(&self, salt: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        salt.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for Construction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Origin::Direct => write!(f, "direct {}", self.reason),
            Origin::Derived { object, observer } => {
                write!(f, "{observer}@{object} {}", self.reason)
            }
        }
    }
}

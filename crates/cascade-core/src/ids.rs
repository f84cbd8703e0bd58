//! Stable handles for objects, properties, observers and classes.
//!
//! Objects never hold references to each other. Everything that points at an
//! object (parent pointers, reasons, values) stores an [`ObjectId`] into the
//! engine's object table instead.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle of a mutable object.
///
/// Ids are never reused, so a historical [`State`](crate::State) always
/// resolves against the same object table. Ids of derived objects carry the
/// high bit and are computed from their construction, which keeps them
/// independent of worker scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The root object owning the whole graph.
    pub const UNIVERSE: ObjectId = ObjectId(0);

    const DERIVED_BIT: u64 = 1 << 63;

    /// Build the id of a derived object from a construction hash.
    pub fn derived(hash: u64) -> Self {
        Self(hash | Self::DERIVED_BIT)
    }

    /// Check if this is the universe.
    pub fn is_universe(self) -> bool {
        self == Self::UNIVERSE
    }

    /// Check if this id was computed from a construction.
    pub fn is_derived(self) -> bool {
        self.0 & Self::DERIVED_BIT != 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_derived() {
            write!(f, "d{:x}", self.0 & !Self::DERIVED_BIT)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Declared property, resolved once by the [`Registry`](crate::Registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyId(pub u32);

/// Declared observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObserverId(pub u32);

/// Declared object class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Class of the universe object, always present in a registry.
    pub const UNIVERSE: ClassId = ClassId(0);
}

/// Sequence number of a submitted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(pub u64);

macro_rules! display_id {
    ($($ty:ident => $prefix:literal),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        })*
    };
}

display_id!(PropertyId => "p", ObserverId => "o", ClassId => "c", ActionId => "a");

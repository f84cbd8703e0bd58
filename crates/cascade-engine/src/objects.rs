//! Arena of object metadata.
//!
//! The state only ever stores [`ObjectId`]s. Class and display name live
//! here, outside the versioned state, because they never change once an
//! object exists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cascade_core::{ClassId, Construction, ObjectId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Immutable facts about an allocated object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub class: ClassId,
    pub name: Option<Arc<str>>,
}

/// Allocates object ids and remembers their class.
///
/// Entries are never removed: snapshots in the time-travel history may still
/// refer to objects whose state has been cleared.
#[derive(Debug)]
pub struct ObjectTable {
    next: AtomicU64,
    metas: DashMap<ObjectId, ObjectMeta>,
}

impl ObjectTable {
    pub fn new(universe_class: ClassId) -> Self {
        let metas = DashMap::new();
        metas.insert(
            ObjectId::UNIVERSE,
            ObjectMeta {
                class: universe_class,
                name: Some(Arc::from("universe")),
            },
        );
        Self {
            next: AtomicU64::new(1),
            metas,
        }
    }

    /// Allocate a fresh object with a sequential id.
    pub fn allocate(&self, class: ClassId, name: Option<&str>) -> ObjectId {
        let id = ObjectId(self.next.fetch_add(1, Ordering::Relaxed));
        self.metas.insert(
            id,
            ObjectMeta {
                class,
                name: name.map(Arc::from),
            },
        );
        id
    }

    /// Allocate an object for a derived construction.
    ///
    /// The id is a hash of the construction, so it does not depend on which
    /// worker thread got there first. If the hash is taken (an earlier
    /// object for the same construction, or a collision) the next salt is
    /// tried.
    pub fn allocate_derived(&self, class: ClassId, construction: &Construction) -> ObjectId {
        let mut salt = 0;
        loop {
            let id = ObjectId::derived(construction.stable_hash(salt));
            if let Entry::Vacant(slot) = self.metas.entry(id) {
                slot.insert(ObjectMeta { class, name: None });
                return id;
            }
            salt += 1;
        }
    }

    pub fn class_of(&self, id: ObjectId) -> Option<ClassId> {
        self.metas.get(&id).map(|m| m.class)
    }

    pub fn name(&self, id: ObjectId) -> Option<Arc<str>> {
        self.metas.get(&id).and_then(|m| m.name.clone())
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.metas.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }
}

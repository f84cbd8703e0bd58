//! Persistent, structurally shared snapshots of the object graph.
//!
//! A [`State`] maps `(object, slot)` to a [`Cell`]. User properties live in
//! [`Slot::Property`] cells holding a [`Value`]; the remaining slots carry the
//! engine's own bookkeeping (parent pointers, dependency sets, construction
//! records, queues) so that all of it is versioned, diffed and merged the
//! same way.
//!
//! ```text
//! State  = OrdMap<ObjectId, ObjectState>
//! Object = OrdMap<Slot, Cell>
//! ```
//!
//! Cells equal to the property default are never stored, so two states with
//! the same content are always equal and their diff is empty.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::iter::Peekable;
use std::sync::Arc;

use imbl::OrdMap;

use crate::construction::{Construction, Reason};
use crate::error::EngineError;
use crate::ids::{ObjectId, ObserverId, PropertyId};
use crate::priority::{Direction, Priority, Queued};
use crate::property::PropertySpec;
use crate::value::Value;

/// Back-pointer from a child to the property holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Containing {
    pub parent: ObjectId,
    pub property: PropertyId,
}

/// Object read by an observer, keyed by self vs. other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Observee {
    This,
    Other(ObjectId),
}

impl Observee {
    pub fn of(object: ObjectId, target: ObjectId) -> Self {
        if object == target {
            Observee::This
        } else {
            Observee::Other(object)
        }
    }

    pub fn resolve(self, target: ObjectId) -> ObjectId {
        match self {
            Observee::This => target,
            Observee::Other(o) => o,
        }
    }
}

/// Observed properties an observer instance read, per property.
pub type Dependencies = BTreeMap<PropertyId, BTreeSet<Observee>>;

/// Observer instance registered in a property's reverse index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reader {
    pub target: ObjectId,
    pub observer: ObserverId,
}

/// Addressable slot of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    /// A user property.
    Property(PropertyId),
    Parent,
    /// Transaction id of the last change in this object or below.
    ChangeId,
    /// Set while the object's observers are live.
    Active,
    /// Reverse index of observers reading a property, per direction.
    Readers(PropertyId, Direction),
    Dependencies(ObserverId),
    /// Reason to object map of what an observer constructed here.
    Constructed(ObserverId),
    /// All constructions this newable currently satisfies.
    Derivations,
    /// Construction the object was first allocated for.
    InitialConstruction,
    /// Object that took over this one during matching.
    Replacing,
    /// Last failure of an observer on this object.
    Exception(ObserverId),
    /// Work queued at a tier; stored on the universe.
    Queue(Priority),
    /// Change counter of an imperative bridge folded into this state.
    Absorbed(u32),
}

impl Slot {
    pub fn property(self) -> Option<PropertyId> {
        match self {
            Slot::Property(p) => Some(p),
            _ => None,
        }
    }
}

/// Content of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Value(Value),
    Parent(Containing),
    Counter(u64),
    Flag,
    Readers(Arc<BTreeSet<Reader>>),
    Dependencies(Arc<Dependencies>),
    Constructed(Arc<BTreeMap<Reason, ObjectId>>),
    Constructions(Arc<BTreeSet<Construction>>),
    Construction(Arc<Construction>),
    Object(ObjectId),
    Failure(Arc<EngineError>),
    Queue(Arc<BTreeSet<Queued>>),
}

impl Cell {
    /// Three-way merge of a branch into an accumulated result.
    ///
    /// `ours` and `theirs` both descend from `base`. Set-like cells take the
    /// union of both sides' additions and removals; counters keep the
    /// maximum; any other conflict resolves to `theirs`, the later branch.
    pub fn merge3(base: Option<&Cell>, ours: Option<&Cell>, theirs: Option<&Cell>) -> Option<Cell> {
        if ours == base {
            return theirs.cloned();
        }
        if theirs == base || ours == theirs {
            return ours.cloned();
        }
        match ours.or(theirs).or(base) {
            Some(Cell::Readers(_)) => {
                let get = |c: Option<&Cell>| match c {
                    Some(Cell::Readers(s)) => s.as_ref().clone(),
                    _ => BTreeSet::new(),
                };
                let merged = merge_sets(&get(base), &get(ours), &get(theirs));
                (!merged.is_empty()).then(|| Cell::Readers(Arc::new(merged)))
            }
            Some(Cell::Queue(_)) => {
                let get = |c: Option<&Cell>| match c {
                    Some(Cell::Queue(s)) => s.as_ref().clone(),
                    _ => BTreeSet::new(),
                };
                let merged = merge_sets(&get(base), &get(ours), &get(theirs));
                (!merged.is_empty()).then(|| Cell::Queue(Arc::new(merged)))
            }
            Some(Cell::Constructions(_)) => {
                let get = |c: Option<&Cell>| match c {
                    Some(Cell::Constructions(s)) => s.as_ref().clone(),
                    _ => BTreeSet::new(),
                };
                let merged = merge_sets(&get(base), &get(ours), &get(theirs));
                (!merged.is_empty()).then(|| Cell::Constructions(Arc::new(merged)))
            }
            Some(Cell::Dependencies(_)) => {
                let get = |c: Option<&Cell>| match c {
                    Some(Cell::Dependencies(d)) => d.as_ref().clone(),
                    _ => Dependencies::new(),
                };
                let merged = merge_maps(&get(base), &get(ours), &get(theirs), |b, o, t| {
                    let empty = BTreeSet::new();
                    let m = merge_sets(b.unwrap_or(&empty), o.unwrap_or(&empty), t.unwrap_or(&empty));
                    (!m.is_empty()).then_some(m)
                });
                (!merged.is_empty()).then(|| Cell::Dependencies(Arc::new(merged)))
            }
            Some(Cell::Constructed(_)) => {
                let get = |c: Option<&Cell>| match c {
                    Some(Cell::Constructed(m)) => m.as_ref().clone(),
                    _ => BTreeMap::new(),
                };
                let merged = merge_maps(&get(base), &get(ours), &get(theirs), |_, o, t| {
                    t.or(o).copied()
                });
                (!merged.is_empty()).then(|| Cell::Constructed(Arc::new(merged)))
            }
            Some(Cell::Counter(_)) => {
                let get = |c: Option<&Cell>| match c {
                    Some(Cell::Counter(n)) => *n,
                    _ => 0,
                };
                Some(Cell::Counter(get(ours).max(get(theirs))))
            }
            Some(Cell::Value(v)) if v.is_collection() => {
                let get = |c: Option<&Cell>| match c {
                    Some(Cell::Value(v)) => v.clone(),
                    _ => Value::Null,
                };
                let merged = merge_collections(&get(base), &get(ours), &get(theirs));
                (!merged.is_empty()).then_some(Cell::Value(merged))
            }
            _ => theirs.cloned(),
        }
    }
}

fn merge_sets<T: Ord + Clone>(base: &BTreeSet<T>, ours: &BTreeSet<T>, theirs: &BTreeSet<T>) -> BTreeSet<T> {
    let mut merged = ours.clone();
    for added in theirs.difference(base) {
        merged.insert(added.clone());
    }
    for removed in base.difference(theirs) {
        merged.remove(removed);
    }
    merged
}

fn merge_maps<K, V, F>(
    base: &BTreeMap<K, V>,
    ours: &BTreeMap<K, V>,
    theirs: &BTreeMap<K, V>,
    conflict: F,
) -> BTreeMap<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
    F: Fn(Option<&V>, Option<&V>, Option<&V>) -> Option<V>,
{
    let keys: BTreeSet<&K> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();
    let mut merged = BTreeMap::new();
    for k in keys {
        let (b, o, t) = (base.get(k), ours.get(k), theirs.get(k));
        let value = if o == b {
            t.cloned()
        } else if t == b || o == t {
            o.cloned()
        } else {
            conflict(b, o, t)
        };
        if let Some(v) = value {
            merged.insert(k.clone(), v);
        }
    }
    merged
}

fn merge_collections(base: &Value, ours: &Value, theirs: &Value) -> Value {
    let base_items = base.elements();
    let their_items = theirs.elements();
    let mut merged: Vec<Value> = ours
        .elements()
        .into_iter()
        .filter(|e| !base_items.contains(e) || their_items.contains(e))
        .collect();
    for e in their_items {
        if !base_items.contains(&e) && !merged.contains(&e) {
            merged.push(e);
        }
    }
    let shape = if ours.is_collection() { ours } else { theirs };
    shape.with_elements(merged)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ObjectState {
    cells: OrdMap<Slot, Cell>,
}

/// One changed slot between two states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub object: ObjectId,
    pub slot: Slot,
    pub old: Option<Cell>,
    pub new: Option<Cell>,
}

/// One changed user property between two states; `None` means default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub object: ObjectId,
    pub property: PropertyId,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Immutable snapshot of the whole graph.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct State {
    objects: OrdMap<ObjectId, ObjectState>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of objects holding at least one cell.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    /// Whether `object` holds any cell.
    pub fn has_object(&self, object: ObjectId) -> bool {
        self.objects.contains_key(&object)
    }

    pub fn cell(&self, object: ObjectId, slot: Slot) -> Option<&Cell> {
        self.objects.get(&object).and_then(|o| o.cells.get(&slot))
    }

    /// Slots held by an object, in slot order.
    pub fn cells(&self, object: ObjectId) -> Vec<(Slot, Cell)> {
        self.objects
            .get(&object)
            .map(|o| o.cells.iter().map(|(s, c)| (*s, c.clone())).collect())
            .unwrap_or_default()
    }

    /// Replace a cell on this (owned) snapshot, returning the old cell.
    ///
    /// Other snapshots sharing structure are unaffected.
    pub fn put(&mut self, object: ObjectId, slot: Slot, cell: Option<Cell>) -> Option<Cell> {
        let mut entry = self.objects.get(&object).cloned().unwrap_or_default();
        let old = match cell {
            Some(cell) => entry.cells.insert(slot, cell),
            None => entry.cells.remove(&slot),
        };
        if entry.cells.is_empty() {
            self.objects.remove(&object);
        } else {
            self.objects.insert(object, entry);
        }
        old
    }

    /// Functional form of [`State::put`].
    pub fn with(&self, object: ObjectId, slot: Slot, cell: Option<Cell>) -> State {
        let mut next = self.clone();
        next.put(object, slot, cell);
        next
    }

    /// Drop every cell of an object.
    pub fn clear_object(&mut self, object: ObjectId) -> bool {
        self.objects.remove(&object).is_some()
    }

    /// Raw stored value of a property, without default.
    pub fn value(&self, object: ObjectId, property: PropertyId) -> Option<&Value> {
        match self.cell(object, Slot::Property(property)) {
            Some(Cell::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Current value, or the property default.
    pub fn get(&self, object: ObjectId, property: &PropertySpec) -> Value {
        self.value(object, property.id)
            .cloned()
            .unwrap_or_else(|| property.default.clone())
    }

    /// Set a value, returning the next state and the prior value.
    ///
    /// An equal value yields a state equal to `self`.
    pub fn set(&self, object: ObjectId, property: &PropertySpec, value: Value) -> (State, Value) {
        let mut next = self.clone();
        let old = next.set_value(object, property, value);
        (next, old)
    }

    /// In-place form of [`State::set`] on an owned snapshot.
    pub fn set_value(&mut self, object: ObjectId, property: &PropertySpec, value: Value) -> Value {
        let old = self.get(object, property);
        if old == value {
            return old;
        }
        let cell = (value != property.default).then_some(Cell::Value(value));
        self.put(object, Slot::Property(property.id), cell);
        old
    }

    pub fn parent(&self, object: ObjectId) -> Option<Containing> {
        match self.cell(object, Slot::Parent) {
            Some(Cell::Parent(c)) => Some(*c),
            _ => None,
        }
    }

    pub fn change_id(&self, object: ObjectId) -> u64 {
        match self.cell(object, Slot::ChangeId) {
            Some(Cell::Counter(n)) => *n,
            _ => 0,
        }
    }

    /// Id of the transaction this state belongs to.
    pub fn transaction_id(&self) -> u64 {
        self.change_id(ObjectId::UNIVERSE)
    }

    pub fn is_active(&self, object: ObjectId) -> bool {
        matches!(self.cell(object, Slot::Active), Some(Cell::Flag))
    }

    /// Whether `object` has a chain of parents up to the universe.
    pub fn is_rooted(&self, object: ObjectId) -> bool {
        let mut current = object;
        for _ in 0..=self.objects.len() {
            if current.is_universe() {
                return true;
            }
            match self.parent(current) {
                Some(c) => current = c.parent,
                None => return false,
            }
        }
        false
    }

    pub fn readers(&self, object: ObjectId, property: PropertyId, direction: Direction) -> Arc<BTreeSet<Reader>> {
        match self.cell(object, Slot::Readers(property, direction)) {
            Some(Cell::Readers(r)) => r.clone(),
            _ => Arc::default(),
        }
    }

    pub fn dependencies(&self, object: ObjectId, observer: ObserverId) -> Arc<Dependencies> {
        match self.cell(object, Slot::Dependencies(observer)) {
            Some(Cell::Dependencies(d)) => d.clone(),
            _ => Arc::default(),
        }
    }

    pub fn constructed(&self, object: ObjectId, observer: ObserverId) -> Arc<BTreeMap<Reason, ObjectId>> {
        match self.cell(object, Slot::Constructed(observer)) {
            Some(Cell::Constructed(m)) => m.clone(),
            _ => Arc::default(),
        }
    }

    pub fn derivations(&self, object: ObjectId) -> Arc<BTreeSet<Construction>> {
        match self.cell(object, Slot::Derivations) {
            Some(Cell::Constructions(c)) => c.clone(),
            _ => Arc::default(),
        }
    }

    pub fn initial_construction(&self, object: ObjectId) -> Option<Arc<Construction>> {
        match self.cell(object, Slot::InitialConstruction) {
            Some(Cell::Construction(c)) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn replacing(&self, object: ObjectId) -> Option<ObjectId> {
        match self.cell(object, Slot::Replacing) {
            Some(Cell::Object(o)) => Some(*o),
            _ => None,
        }
    }

    pub fn exception(&self, object: ObjectId, observer: ObserverId) -> Option<Arc<EngineError>> {
        match self.cell(object, Slot::Exception(observer)) {
            Some(Cell::Failure(e)) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn queue(&self, priority: Priority) -> Arc<BTreeSet<Queued>> {
        match self.cell(ObjectId::UNIVERSE, Slot::Queue(priority)) {
            Some(Cell::Queue(q)) => q.clone(),
            _ => Arc::default(),
        }
    }

    /// Most urgent tier among `tiers` with queued work.
    pub fn first_queued(&self, tiers: &[Priority]) -> Option<Priority> {
        tiers.iter().copied().find(|p| !self.queue(*p).is_empty())
    }

    pub fn absorbed(&self, imperative: u32) -> u64 {
        match self.cell(ObjectId::UNIVERSE, Slot::Absorbed(imperative)) {
            Some(Cell::Counter(n)) => *n,
            _ => 0,
        }
    }

    /// Lazily enumerate every changed slot from `self` to `other`.
    pub fn diff<'a>(&'a self, other: &'a State) -> Diff<'a> {
        self.diff_filtered(other, |_| true, |_| true)
    }

    /// [`State::diff`] restricted by object and slot predicates.
    pub fn diff_filtered<'a>(
        &'a self,
        other: &'a State,
        object_filter: impl Fn(ObjectId) -> bool + 'a,
        slot_filter: impl Fn(Slot) -> bool + 'a,
    ) -> Diff<'a> {
        Diff {
            left: iter_objects(self),
            right: iter_objects(other),
            pending: VecDeque::new(),
            object_filter: Box::new(object_filter),
            slot_filter: Box::new(slot_filter),
        }
    }

    /// User property changes from `self` to `other`.
    pub fn property_changes<'a>(&'a self, other: &'a State) -> impl Iterator<Item = PropertyChange> + 'a {
        self.diff_filtered(other, |_| true, |s| matches!(s, Slot::Property(_)))
            .filter_map(|c| {
                let property = c.slot.property()?;
                let value = |cell: Option<Cell>| match cell {
                    Some(Cell::Value(v)) => Some(v),
                    _ => None,
                };
                Some(PropertyChange {
                    object: c.object,
                    property,
                    old: value(c.old),
                    new: value(c.new),
                })
            })
    }

    /// Fold the changes `branch` made relative to `base` into this state.
    pub fn merge_from(&mut self, base: &State, branch: &State) {
        let changes: Vec<Change> = base.diff(branch).collect();
        for change in changes {
            let ours = self.cell(change.object, change.slot).cloned();
            let merged = Cell::merge3(change.old.as_ref(), ours.as_ref(), change.new.as_ref());
            self.put(change.object, change.slot, merged);
        }
    }

    /// Merge sibling branches that all started from `base`, in order.
    pub fn merge(base: &State, branches: &[State]) -> State {
        let mut merged = base.clone();
        for branch in branches {
            merged.merge_from(base, branch);
        }
        merged
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (object, entry) in self.objects.iter() {
            let cells: Vec<String> = entry
                .cells
                .iter()
                .map(|(slot, cell)| format!("{slot:?}={cell:?}"))
                .collect();
            map.entry(object, &cells);
        }
        map.finish()
    }
}

type ObjectIter<'a> = Peekable<Box<dyn Iterator<Item = (ObjectId, &'a ObjectState)> + 'a>>;

fn iter_objects(state: &State) -> ObjectIter<'_> {
    let iter: Box<dyn Iterator<Item = (ObjectId, &ObjectState)> + '_> =
        Box::new(state.objects.iter().map(|(k, v)| (*k, v)));
    iter.peekable()
}

/// Lazy sequence of [`Change`]s, produced one object at a time.
pub struct Diff<'a> {
    left: ObjectIter<'a>,
    right: ObjectIter<'a>,
    pending: VecDeque<Change>,
    object_filter: Box<dyn Fn(ObjectId) -> bool + 'a>,
    slot_filter: Box<dyn Fn(Slot) -> bool + 'a>,
}

impl Diff<'_> {
    fn push_object(&mut self, object: ObjectId, old: Option<&ObjectState>, new: Option<&ObjectState>) {
        if !(self.object_filter)(object) || old == new {
            return;
        }
        let empty = OrdMap::new();
        let old_cells = old.map(|o| &o.cells).unwrap_or(&empty);
        let new_cells = new.map(|o| &o.cells).unwrap_or(&empty);
        let mut l = old_cells.iter().peekable();
        let mut r = new_cells.iter().peekable();
        loop {
            let (slot, old, new) = match (l.peek(), r.peek()) {
                (None, None) => break,
                (Some((ls, _)), Some((rs, _))) if ls == rs => {
                    let (slot, old) = l.next().map(|(s, c)| (*s, c.clone())).unzip_pair();
                    let new = r.next().map(|(_, c)| c.clone());
                    (slot, old, new)
                }
                (Some((ls, _)), Some((rs, _))) if ls < rs => {
                    let (slot, old) = l.next().map(|(s, c)| (*s, c.clone())).unzip_pair();
                    (slot, old, None)
                }
                (Some(_), None) => {
                    let (slot, old) = l.next().map(|(s, c)| (*s, c.clone())).unzip_pair();
                    (slot, old, None)
                }
                _ => {
                    let (slot, new) = r.next().map(|(s, c)| (*s, c.clone())).unzip_pair();
                    (slot, None, new)
                }
            };
            let Some(slot) = slot else { break };
            if old != new && (self.slot_filter)(slot) {
                self.pending.push_back(Change {
                    object,
                    slot,
                    old,
                    new,
                });
            }
        }
    }
}

trait UnzipPair<A, B> {
    fn unzip_pair(self) -> (Option<A>, Option<B>);
}

impl<A, B> UnzipPair<A, B> for Option<(A, B)> {
    fn unzip_pair(self) -> (Option<A>, Option<B>) {
        match self {
            Some((a, b)) => (Some(a), Some(b)),
            None => (None, None),
        }
    }
}

impl Iterator for Diff<'_> {
    type Item = Change;

    fn next(&mut self) -> Option<Change> {
        loop {
            if let Some(change) = self.pending.pop_front() {
                return Some(change);
            }
            let (object, old, new) = match (self.left.peek(), self.right.peek()) {
                (None, None) => return None,
                (Some((lk, _)), Some((rk, _))) if lk == rk => {
                    let (object, old) = self.left.next()?;
                    let (_, new) = self.right.next()?;
                    (object, Some(old), Some(new))
                }
                (Some((lk, _)), Some((rk, _))) if lk < rk => {
                    let (object, old) = self.left.next()?;
                    (object, Some(old), None)
                }
                (Some(_), None) => {
                    let (object, old) = self.left.next()?;
                    (object, Some(old), None)
                }
                _ => {
                    let (object, new) = self.right.next()?;
                    (object, None, Some(new))
                }
            };
            self.push_object(object, old, new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ObserverId;
    use proptest::prelude::*;

    fn spec(id: u32, default: Value) -> PropertySpec {
        let mut p = PropertySpec::observed("p").with_default(default);
        p.id = PropertyId(id);
        p
    }

    #[test]
    fn test_get_returns_default() {
        let p = spec(0, Value::Int(7));
        let s = State::new();
        assert_eq!(s.get(ObjectId(1), &p), Value::Int(7));
    }

    #[test]
    fn test_set_returns_old_and_shares() {
        let p = spec(0, Value::Null);
        let s0 = State::new();
        let (s1, old) = s0.set(ObjectId(1), &p, Value::Int(3));
        assert_eq!(old, Value::Null);
        assert_eq!(s1.get(ObjectId(1), &p), Value::Int(3));
        assert!(s0.is_empty());

        let (s2, old) = s1.set(ObjectId(1), &p, Value::Null);
        assert_eq!(old, Value::Int(3));
        assert_eq!(s2, s0);
    }

    #[test]
    fn test_diff_reports_each_side() {
        let p = spec(0, Value::Null);
        let q = spec(1, Value::Null);
        let (a, _) = State::new().set(ObjectId(1), &p, Value::Int(1));
        let (b, _) = a.set(ObjectId(1), &q, Value::Int(2));
        let (b, _) = b.set(ObjectId(2), &p, Value::Int(3));

        let changes: Vec<_> = a.property_changes(&b).collect();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].object, ObjectId(1));
        assert_eq!(changes[0].property, PropertyId(1));
        assert_eq!(changes[1].new, Some(Value::Int(3)));

        let only_two: Vec<_> = a.diff_filtered(&b, |o| o == ObjectId(2), |_| true).collect();
        assert_eq!(only_two.len(), 1);
    }

    #[test]
    fn test_merge_unions_sets_and_prefers_later_scalar() {
        let tags = spec(0, Value::empty_set());
        let name = spec(1, Value::Null);
        let (base, _) = State::new().set(ObjectId(1), &tags, Value::set([Value::Int(1)]));

        let (left, _) = base.set(ObjectId(1), &tags, Value::set([Value::Int(1), Value::Int(2)]));
        let (left, _) = left.set(ObjectId(1), &name, Value::from("left"));
        let (right, _) = base.set(ObjectId(1), &tags, Value::set([Value::Int(3)]));
        let (right, _) = right.set(ObjectId(1), &name, Value::from("right"));

        let merged = State::merge(&base, &[left, right]);
        assert_eq!(
            merged.get(ObjectId(1), &tags),
            Value::set([Value::Int(2), Value::Int(3)])
        );
        assert_eq!(merged.get(ObjectId(1), &name), Value::from("right"));
    }

    #[test]
    fn test_merge_readers_and_queues() {
        let base = State::new();
        let r1 = Reader { target: ObjectId(1), observer: ObserverId(0) };
        let r2 = Reader { target: ObjectId(2), observer: ObserverId(0) };
        let slot = Slot::Readers(PropertyId(0), Direction::Forward);
        let left = base.with(ObjectId(5), slot, Some(Cell::Readers(Arc::new([r1].into()))));
        let right = base.with(ObjectId(5), slot, Some(Cell::Readers(Arc::new([r2].into()))));
        let merged = State::merge(&base, &[left, right]);
        assert_eq!(merged.readers(ObjectId(5), PropertyId(0), Direction::Forward).len(), 2);
    }

    #[test]
    fn test_is_rooted() {
        let mut s = State::new();
        s.put(ObjectId(1), Slot::Parent, Some(Cell::Parent(Containing { parent: ObjectId::UNIVERSE, property: PropertyId(0) })));
        s.put(ObjectId(2), Slot::Parent, Some(Cell::Parent(Containing { parent: ObjectId(1), property: PropertyId(0) })));
        s.put(ObjectId(3), Slot::Parent, Some(Cell::Parent(Containing { parent: ObjectId(9), property: PropertyId(0) })));
        assert!(s.is_rooted(ObjectId(2)));
        assert!(!s.is_rooted(ObjectId(3)));
        assert!(s.is_rooted(ObjectId::UNIVERSE));
    }

    fn arb_ops() -> impl Strategy<Value = Vec<(u64, u32, i64)>> {
        prop::collection::vec((0u64..6, 0u32..3, -3i64..4), 0..24)
    }

    fn build(ops: &[(u64, u32, i64)]) -> State {
        let mut s = State::new();
        for (o, p, v) in ops {
            let spec = spec(*p, Value::Int(0));
            s.set_value(ObjectId(*o), &spec, Value::Int(*v));
        }
        s
    }

    proptest! {
        #[test]
        fn prop_diff_empty_iff_equal(a in arb_ops(), b in arb_ops()) {
            let s1 = build(&a);
            let s2 = build(&b);
            prop_assert_eq!(s1.diff(&s2).next().is_none(), s1 == s2);
        }

        #[test]
        fn prop_set_is_idempotent(ops in arb_ops(), o in 0u64..6, p in 0u32..3, v in -3i64..4) {
            let spec = spec(p, Value::Int(0));
            let s = build(&ops);
            let (once, _) = s.set(ObjectId(o), &spec, Value::Int(v));
            let (twice, old) = once.set(ObjectId(o), &spec, Value::Int(v));
            prop_assert_eq!(old, Value::Int(v));
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_merge_of_single_branch_is_branch(a in arb_ops(), b in arb_ops()) {
            let base = build(&a);
            let mut ops = a.clone();
            ops.extend(b);
            let branch = build(&ops);
            prop_assert_eq!(State::merge(&base, &[branch.clone()]), branch);
        }
    }
}

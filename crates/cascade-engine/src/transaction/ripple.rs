//! Ripple-out: deferring a write to a later tier.
//!
//! A write that would undo or pre-empt a change made in a cycle that is
//! still open is not applied now. The element (or scalar) keeps its current
//! value and the observer re-runs at the tier of the first matching rule:
//!
//! | tier    | added / changed                        | removed                          |
//! |---------|----------------------------------------|----------------------------------|
//! | `inner` | removed (changed) since inner start    | added since inner start          |
//! | `three` | element became derived                 |                                  |
//! | `four`  | observer is new and the action removed | observer is new and action added |
//! | `four`  | element became contained (changed)     | element became contained         |
//! | `outer` | removed during the previous outer cycle| added during the previous outer  |

use cascade_core::{Construction, ObjectId, Priority, PropertySpec, State, Value};
use tracing::debug;

use super::ObserverTransaction;

impl ObserverTransaction<'_> {
    pub(crate) fn ripple_out(
        &mut self,
        object: ObjectId,
        spec: &PropertySpec,
        pre: &Value,
        post: Value,
    ) -> Value {
        let is_collection = (pre.is_collection() || *pre == Value::Null)
            && (post.is_collection() || post == Value::Null)
            && (pre.is_collection() || post.is_collection());
        let is_list = matches!(pre, Value::List(_)) || matches!(post, Value::List(_));

        if is_collection {
            let before = pre.elements();
            let after = post.elements();
            let mut result = after.clone();
            let mut deferred = None;
            for added in after.iter().filter(|e| !before.contains(e)) {
                if let Some(tier) = self.added_tier(object, spec, added) {
                    deferred = Some(tier);
                    self.defer_to(tier);
                    result.retain(|e| e != added);
                }
            }
            for (index, removed) in before.iter().enumerate().filter(|(_, e)| !after.contains(e)) {
                if let Some(tier) = self.removed_tier(object, spec, removed) {
                    deferred = Some(tier);
                    self.defer_to(tier);
                    let at = index.min(result.len());
                    result.insert(at, removed.clone());
                }
            }
            let shape = if post.is_collection() { &post } else { pre };
            let rippled = shape.with_elements(result);
            if let Some(tier) = deferred {
                self.trace_ripple(object, spec, tier, &post, &rippled);
                return rippled;
            }
            if !is_list {
                return post;
            }
        }

        if let Some(tier) = self.changed_tier(object, spec, pre, &post) {
            self.defer_to(tier);
            self.trace_ripple(object, spec, tier, &post, pre);
            return pre.clone();
        }
        post
    }

    fn trace_ripple(&self, object: ObjectId, spec: &PropertySpec, tier: Priority, wanted: &Value, kept: &Value) {
        if self.core.shared.config.trace_ripple_out {
            debug!(
                %object,
                property = %spec.name,
                observer = %self.observer.name,
                %tier,
                %wanted,
                %kept,
                "ripple_out"
            );
        }
    }

    fn added_tier(&self, object: ObjectId, spec: &PropertySpec, element: &Value) -> Option<Priority> {
        let s = self.core.snapshots;
        let holds = |state: &State| state.get(object, spec).contains(element);
        if holds(s.start(Priority::Inner)) || self.child_changed(spec, element, s.start(Priority::Inner)) {
            Some(Priority::Inner)
        } else if self.became_derived(element, s.start(Priority::Three)) {
            Some(Priority::Three)
        } else if self.is_new(s.start(Priority::Four))
            && holds(&s.action_start)
            && !holds(s.start(Priority::Four))
        {
            Some(Priority::Four)
        } else if holds(&s.prev_outer) && !holds(s.start(Priority::Outer)) {
            Some(Priority::Outer)
        } else {
            None
        }
    }

    fn removed_tier(&self, object: ObjectId, spec: &PropertySpec, element: &Value) -> Option<Priority> {
        let s = self.core.snapshots;
        let holds = |state: &State| state.get(object, spec).contains(element);
        if !holds(s.start(Priority::Inner)) || self.child_changed(spec, element, s.start(Priority::Inner)) {
            Some(Priority::Inner)
        } else if self.is_new(s.start(Priority::Four))
            && !holds(&s.action_start)
            && holds(s.start(Priority::Four))
        {
            Some(Priority::Four)
        } else if became_contained(element, s.start(Priority::Four), s.start(Priority::Inner)) {
            Some(Priority::Four)
        } else if !holds(&s.prev_outer) && holds(s.start(Priority::Outer)) {
            Some(Priority::Outer)
        } else {
            None
        }
    }

    fn changed_tier(&self, object: ObjectId, spec: &PropertySpec, pre: &Value, post: &Value) -> Option<Priority> {
        let s = self.core.snapshots;
        let changed_back = |from: &State, to: &State| {
            let before = from.get(object, spec);
            before == *post && (std::ptr::eq(to, &self.core.state) || before != to.get(object, spec))
        };
        let child_changed = |from: &State| {
            self.child_changed(spec, pre, from) || self.child_changed(spec, post, from)
        };
        let inner = s.start(Priority::Inner);
        let four = s.start(Priority::Four);
        if changed_back(inner, &self.core.state) || child_changed(inner) {
            Some(Priority::Inner)
        } else if self.became_derived(post, s.start(Priority::Three)) {
            Some(Priority::Three)
        } else if self.is_new(four) && changed_back(&s.action_start, four) {
            Some(Priority::Four)
        } else if became_contained(pre, four, inner) {
            Some(Priority::Four)
        } else if changed_back(&s.prev_outer, s.start(Priority::Outer)) {
            Some(Priority::Outer)
        } else {
            None
        }
    }

    /// The observer started on its target since `from`.
    fn is_new(&self, from: &State) -> bool {
        let target = self.core.target;
        !from.is_active(target) && self.core.state.is_active(target)
    }

    /// A contained child changed since `from`.
    fn child_changed(&self, spec: &PropertySpec, element: &Value, from: &State) -> bool {
        let Some(child) = element.as_object() else {
            return false;
        };
        spec.containment
            && from.parent(child).is_some()
            && self.core.state.change_id(child) > from.transaction_id()
    }

    /// A newable got its first derived construction since `from`.
    fn became_derived(&self, element: &Value, from: &State) -> bool {
        let Some(object) = element.as_object() else {
            return false;
        };
        let state = &self.core.state;
        state
            .initial_construction(object)
            .is_some_and(|c| c.is_derived())
            && !from.derivations(object).iter().any(Construction::is_derived)
            && state.derivations(object).iter().any(Construction::is_derived)
    }
}

/// An element gained a parent between two snapshots.
fn became_contained(element: &Value, from: &State, to: &State) -> bool {
    let Some(object) = element.as_object() else {
        return false;
    };
    from.parent(object).is_none() && to.parent(object).is_some()
}

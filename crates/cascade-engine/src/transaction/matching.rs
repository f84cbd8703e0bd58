//! Reconciliation of newables that turn out to be the same object.
//!
//! When an observer replaces a newable reference (or a collection of them)
//! with a freshly derived one, the old and new candidates are compared. If
//! one must replace the other, the loser hands its constructions to the
//! survivor and the written value keeps the survivor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cascade_core::{Cell, Construction, EngineResult, ObjectId, Origin, PropertySpec, Slot, Value};
use tracing::debug;

use super::derivation::DerivationTransaction;
use super::ObserverTransaction;

/// Facts about one candidate, computed once per match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MatchInfo {
    pub object: ObjectId,
    pub type_name: Arc<str>,
    pub identity: Option<Value>,
    /// Existed at action start, or has a direct construction.
    pub carved: bool,
    /// Had a parent at action start.
    pub old: bool,
    /// Sort keys of the non-derived objects this candidate derives from.
    pub sources: Vec<Value>,
}

impl MatchInfo {
    /// Whether `self` survives a match against `other`.
    pub fn must_replace(&self, other: &MatchInfo) -> bool {
        if self.object == other.object || self.type_name != other.type_name {
            return false;
        }
        if self.carved != other.carved {
            return self.carved
                && self.identity.is_some()
                && (other.identity.is_none() || self.identity == other.identity);
        }
        if self.carved || self.old || other.old {
            return false;
        }
        match (&self.identity, &other.identity) {
            (Some(_), None) => true,
            (Some(a), Some(b)) if a == b => self.precedes(other),
            _ => false,
        }
    }

    fn precedes(&self, other: &MatchInfo) -> bool {
        (&self.sources, self.object) < (&other.sources, other.object)
    }
}

impl ObserverTransaction<'_> {
    /// Facts for `object`, or `None` if it does not take part in matching.
    ///
    /// Only newables declaring an identity function are matched.
    pub(crate) fn match_info(&self, object: ObjectId) -> EngineResult<Option<MatchInfo>> {
        let shared = self.core.shared;
        let Some(newable) = shared.newable(object) else {
            return Ok(None);
        };
        if newable.identity().is_none() {
            return Ok(None);
        }
        let state = &self.core.state;
        let old = self.core.snapshots.action_start.parent(object).is_some();
        let direct = state.derivations(object).iter().any(Construction::is_direct);
        Ok(Some(MatchInfo {
            object,
            type_name: newable.type_name.clone(),
            identity: DerivationTransaction::identity(shared, state, object)?,
            carved: old || direct,
            old,
            sources: self.source_keys(object)?,
        }))
    }

    fn source_keys(&self, object: ObjectId) -> EngineResult<Vec<Value>> {
        let shared = self.core.shared;
        let state = &self.core.state;
        let mut keys = Vec::new();
        let mut seen = BTreeSet::from([object]);
        let mut todo = vec![object];
        while let Some(current) = todo.pop() {
            for construction in state.derivations(current).iter().filter(|c| c.is_derived()) {
                for source in construction.sources() {
                    if !seen.insert(source) {
                        continue;
                    }
                    let derived = shared.newable(source).is_some()
                        && state.derivations(source).iter().any(Construction::is_derived);
                    if derived {
                        todo.push(source);
                    } else {
                        let key = DerivationTransaction::identity(shared, state, source)?
                            .unwrap_or(Value::Object(source));
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Match a replaced scalar reference against its replacement.
    pub(crate) fn single_match(&mut self, before: &Value, after: Value) -> EngineResult<Value> {
        let (Some(b), Some(a)) = (before.as_object(), after.as_object()) else {
            return Ok(after);
        };
        let (Some(pre), Some(post)) = (self.match_info(b)?, self.match_info(a)?) else {
            return Ok(after);
        };
        if pre.must_replace(&post) {
            self.replace(a, b);
            return Ok(before.clone());
        }
        if post.must_replace(&pre) {
            self.replace(b, a);
        } else {
            self.trace_mismatch(&pre, &post);
        }
        Ok(after)
    }

    /// Progressive many-to-many match of two collections.
    ///
    /// Walks the new elements; each derived element is compared against the
    /// not yet consumed old elements of the same type. Lists are finally
    /// ordered like the old list where possible.
    pub(crate) fn many_match(
        &mut self,
        object: ObjectId,
        spec: &PropertySpec,
        bef: &Value,
        aft: Value,
    ) -> EngineResult<Value> {
        let is_list = matches!(aft, Value::List(_)) || matches!(bef, Value::List(_));
        let original_before = bef.elements();
        let original_after = aft.elements();
        let mut afters = original_after.clone();
        let mut pres = original_before.clone();
        let mut infos: BTreeMap<ObjectId, Option<MatchInfo>> = BTreeMap::new();

        let mut position = 0;
        while position < afters.len() {
            let after = afters[position].clone();
            position += 1;
            let Some(a) = after.as_object() else { continue };
            let mut i = 0;
            while i < pres.len() {
                let before = pres[i].clone();
                let Some(b) = before.as_object() else {
                    i += 1;
                    continue;
                };
                if a == b {
                    if is_list {
                        pres.remove(i);
                        break;
                    }
                    i += 1;
                    continue;
                }
                let (Some(pre), Some(post)) = (self.cached_info(&mut infos, b)?, self.cached_info(&mut infos, a)?) else {
                    i += 1;
                    continue;
                };
                if pre.must_replace(&post) {
                    pres.remove(i);
                    if afters.contains(&before) {
                        // The survivor is already present; the duplicate goes.
                        position -= 1;
                        afters.remove(position);
                    } else {
                        afters[position - 1] = before.clone();
                    }
                    self.replace(a, b);
                    infos.clear();
                    break;
                } else if post.must_replace(&pre) && !afters.contains(&before) {
                    pres.remove(i);
                    self.replace(b, a);
                    infos.clear();
                    break;
                }
                self.trace_mismatch(&pre, &post);
                i += 1;
            }
        }

        if is_list && original_before.len() > 1 && afters != original_after {
            let (bl, al) = (original_before.len(), original_after.len());
            let mut keyed: Vec<(usize, Value)> = afters
                .into_iter()
                .enumerate()
                .map(|(current, e)| {
                    let key = original_before
                        .iter()
                        .position(|x| *x == e)
                        .or_else(|| original_after.iter().position(|x| *x == e).map(|i| i + bl))
                        .unwrap_or(bl + al + current);
                    (key, e)
                })
                .collect();
            keyed.sort_by_key(|(key, _)| *key);
            afters = keyed.into_iter().map(|(_, e)| e).collect();
        }

        let shape = if aft.is_collection() { &aft } else { bef };
        let matched = shape.with_elements(afters);
        if self.core.shared.config.trace_matching && matched != aft {
            debug!(%object, property = %spec.name, wanted = %aft, matched = %matched, "many_matched");
        }
        Ok(matched)
    }

    fn cached_info(
        &self,
        infos: &mut BTreeMap<ObjectId, Option<MatchInfo>>,
        object: ObjectId,
    ) -> EngineResult<Option<MatchInfo>> {
        if let Some(info) = infos.get(&object) {
            return Ok(info.clone());
        }
        let info = self.match_info(object)?;
        infos.insert(object, info.clone());
        Ok(info)
    }

    /// Hand the constructions of `replaced` to `replacing`.
    pub(crate) fn replace(&mut self, replaced: ObjectId, replacing: ObjectId) {
        let (target, id) = (self.core.target, self.observer.id);
        if self.core.shared.config.trace_matching {
            debug!(%replaced, %replacing, observer = %self.observer.name, "matched");
        }
        let state = &mut self.core.state;
        state.put(replaced, Slot::Replacing, Some(Cell::Object(replacing)));
        let moved = state.derivations(replaced);
        if moved.is_empty() {
            return;
        }
        let mut into = state.derivations(replacing).as_ref().clone();
        let mine = Origin::Derived {
            object: target,
            observer: id,
        };
        for construction in moved.iter() {
            into.insert(construction.clone());
            if construction.origin == mine {
                self.constructions
                    .insert(construction.reason.clone(), replacing);
            }
        }
        state.put(replacing, Slot::Derivations, Some(Cell::Constructions(Arc::new(into))));
        state.put(replaced, Slot::Derivations, None);
    }

    fn trace_mismatch(&self, pre: &MatchInfo, post: &MatchInfo) {
        if self.core.shared.config.trace_matching {
            debug!(pre = %pre.object, post = %post.object, observer = %self.observer.name, "not_matched");
        }
    }
}

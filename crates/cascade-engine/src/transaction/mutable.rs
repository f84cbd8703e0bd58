//! Micro-cycles: run the leaves queued at one tier and merge their results.
//!
//! Leaves are grouped per target object. Groups run independently, in
//! parallel when configured, each starting from the same pre-state; the
//! leaves of one group run in order on top of each other. Group results are
//! merged in target order, so the outcome does not depend on which worker
//! finished first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use cascade_core::{Direction, LeafRef, ObjectId, Priority, Queued, Slot, State};
use tracing::debug;

use super::{enqueue, ActionTransaction, ObserverTransaction, Transaction, TransactionKind};
use crate::context::{Shared, Snapshots};

type Group = (ObjectId, Vec<Queued>);

pub(crate) struct MutableTransaction<'a> {
    shared: &'a Shared,
    snapshots: &'a Snapshots,
}

impl<'a> MutableTransaction<'a> {
    pub fn new(shared: &'a Shared, snapshots: &'a Snapshots) -> Self {
        Self { shared, snapshots }
    }

    /// Drain the immediate tiers.
    pub fn run(&self, mut state: State) -> State {
        while let Some(tier) = state.first_queued(&Priority::IMMEDIATE) {
            if self.shared.is_killed() {
                break;
            }
            state = self.step(state, tier);
        }
        state
    }

    /// Run everything queued at `tier` once.
    pub fn step(&self, state: State, tier: Priority) -> State {
        let queued = state.queue(tier);
        let mut pre = state;
        pre.put(ObjectId::UNIVERSE, Slot::Queue(tier), None);

        let mut by_target: BTreeMap<ObjectId, Vec<Queued>> = BTreeMap::new();
        for q in queued.iter() {
            by_target.entry(q.target).or_default().push(*q);
        }
        let groups: Vec<Group> = by_target.into_iter().collect();
        let workers = self.shared.config.workers_for(groups.len());
        if self.shared.config.trace_universe {
            debug!(%tier, leaves = queued.len(), mutables = groups.len(), workers, "micro_cycle");
        }

        let branches = if workers <= 1 {
            groups
                .iter()
                .map(|(_, leaves)| self.run_group(&pre, leaves))
                .collect()
        } else {
            self.run_parallel(&pre, &groups, workers)
        };
        self.merge(pre, &groups, branches)
    }

    fn run_group(&self, pre: &State, leaves: &[Queued]) -> State {
        let mut state = pre.clone();
        for queued in leaves {
            if self.shared.is_killed() {
                break;
            }
            state = match queued.leaf {
                LeafRef::Observer(id) => {
                    ObserverTransaction::run(self.shared, self.snapshots, &state, *queued, id)
                }
                LeafRef::Action(id) => {
                    ActionTransaction::run(self.shared, self.snapshots, &state, *queued, id)
                }
            };
        }
        state
    }

    fn run_parallel(&self, pre: &State, groups: &[Group], workers: usize) -> Vec<State> {
        let next = AtomicUsize::new(0);
        let (sender, receiver) = crossbeam_channel::unbounded::<(usize, State)>();
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let sender = sender.clone();
                let next = &next;
                scope.spawn(move || loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some((_, leaves)) = groups.get(index) else {
                        break;
                    };
                    if sender.send((index, self.run_group(pre, leaves))).is_err() {
                        break;
                    }
                });
            }
        });
        drop(sender);

        let mut results: Vec<Option<State>> = vec![None; groups.len()];
        for (index, state) in receiver.iter() {
            results[index] = Some(state);
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| pre.clone()))
            .collect()
    }

    /// Merge group results; observers whose writes lost a conflict run again.
    fn merge(&self, pre: State, groups: &[Group], branches: Vec<State>) -> State {
        if branches.len() <= 1 {
            return branches.into_iter().next().unwrap_or(pre);
        }
        let mut merged = State::merge(&pre, &branches);
        self.trigger_siblings(&pre, &branches, &mut merged);
        for ((target, leaves), branch) in groups.iter().zip(&branches) {
            let lost = pre
                .diff_filtered(branch, |_| true, |s| matches!(s, Slot::Property(_)))
                .any(|c| merged.cell(c.object, c.slot) != c.new.as_ref());
            if !lost {
                continue;
            }
            debug!(%target, "merge_conflict");
            for queued in leaves {
                if matches!(queued.leaf, LeafRef::Observer(_)) {
                    enqueue(&mut merged, *queued, Priority::One);
                }
            }
        }
        merged
    }

    /// Queue readers that registered in a sibling branch, and so read the
    /// pre-state value, of every observed property a branch changed.
    fn trigger_siblings(&self, pre: &State, branches: &[State], merged: &mut State) {
        let registry = &self.shared.registry;
        for branch in branches {
            for change in pre.property_changes(branch) {
                if !registry.property(change.property).is_ok_and(|p| p.is_observed()) {
                    continue;
                }
                for direction in [Direction::Forward, Direction::Backward] {
                    let known = branch.readers(change.object, change.property, direction);
                    let readers = merged.readers(change.object, change.property, direction);
                    for reader in readers.iter().filter(|r| !known.contains(r)) {
                        enqueue(merged, Queued::observer(reader.target, reader.observer), direction.priority());
                    }
                }
            }
        }
    }
}

impl Transaction for MutableTransaction<'_> {
    fn kind(&self) -> TransactionKind {
        TransactionKind::Mutable
    }

    fn target(&self) -> ObjectId {
        ObjectId::UNIVERSE
    }
}

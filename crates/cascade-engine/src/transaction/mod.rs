//! Transaction kinds.
//!
//! A transaction is a unit of work over a state snapshot: it starts from a
//! pre-state and produces a post-state. Leaf transactions run user code
//! (actions and observers); composite transactions schedule leaves and merge
//! their results.
//!
//! ```text
//! UniverseTransaction
//!   └─ MutableTransaction       one micro-cycle over a tier
//!        ├─ ActionTransaction   untracked writes
//!        └─ ObserverTransaction tracked reads, matched and rippled writes
//!             └─ DerivationTransaction  read-only what-if evaluation
//! ```

mod action;
mod derivation;
mod leaf;
mod matching;
mod mutable;
mod observer;
mod ripple;

use std::fmt;
use std::sync::Arc;

use cascade_core::{Cell, Direction, EngineError, EngineResult, ObjectId, Priority, Queued, Slot, State};
use dashmap::DashSet;

pub use action::{Action, ActionFn, ActionTransaction};
pub use derivation::{Derivation, DerivationTransaction};
pub use observer::ObserverTransaction;

pub(crate) use action::ActionBody;
pub(crate) use mutable::MutableTransaction;

/// What a transaction does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionKind {
    Universe,
    Mutable,
    Action,
    Observer,
    Derivation,
    Identity,
    Imperative,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::Universe => "universe",
            TransactionKind::Mutable => "mutable",
            TransactionKind::Action => "action",
            TransactionKind::Observer => "observer",
            TransactionKind::Derivation => "derivation",
            TransactionKind::Identity => "identity",
            TransactionKind::Imperative => "imperative",
        };
        f.write_str(name)
    }
}

/// Common surface of every transaction.
pub trait Transaction {
    fn kind(&self) -> TransactionKind;

    /// Object the transaction runs on.
    fn target(&self) -> ObjectId;

    fn direction(&self) -> Direction {
        Direction::Forward
    }
}

/// Set of leaf transactions currently open.
///
/// A leaf is keyed by kind and queue entry; opening the same leaf twice
/// while it runs is an engine error.
#[derive(Debug, Default)]
pub(crate) struct LeafPool {
    open: DashSet<(TransactionKind, Queued)>,
}

impl LeafPool {
    pub fn open(&self, kind: TransactionKind, queued: Queued) -> EngineResult<LeafGuard<'_>> {
        if !self.open.insert((kind, queued)) {
            return Err(EngineError::Reopened {
                kind: kind.to_string(),
                target: queued.target,
            });
        }
        Ok(LeafGuard {
            pool: self,
            key: (kind, queued),
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.open.len()
    }
}

/// Closes its leaf on drop.
pub(crate) struct LeafGuard<'a> {
    pool: &'a LeafPool,
    key: (TransactionKind, Queued),
}

impl Drop for LeafGuard<'_> {
    fn drop(&mut self) {
        self.pool.open.remove(&self.key);
    }
}

/// Queue `queued` at `tier` on the universe.
pub(crate) fn enqueue(state: &mut State, queued: Queued, tier: Priority) {
    let current = state.queue(tier);
    if current.contains(&queued) {
        return;
    }
    let mut next = current.as_ref().clone();
    next.insert(queued);
    state.put(ObjectId::UNIVERSE, Slot::Queue(tier), Some(Cell::Queue(Arc::new(next))));
}

/// Remove every queue entry matching `filter`.
pub(crate) fn dequeue_where(state: &mut State, filter: impl Fn(&Queued) -> bool) {
    for tier in Priority::ALL {
        let current = state.queue(tier);
        if !current.iter().any(&filter) {
            continue;
        }
        let next: std::collections::BTreeSet<Queued> =
            current.iter().filter(|q| !filter(q)).copied().collect();
        let cell = (!next.is_empty()).then(|| Cell::Queue(Arc::new(next)));
        state.put(ObjectId::UNIVERSE, Slot::Queue(tier), cell);
    }
}

/// Advance the transaction id stored on the universe.
pub(crate) fn next_transaction_id(state: &mut State) -> u64 {
    let id = state.transaction_id() + 1;
    state.put(ObjectId::UNIVERSE, Slot::ChangeId, Some(Cell::Counter(id)));
    id
}

/// Flatten a caught panic into an engine error.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

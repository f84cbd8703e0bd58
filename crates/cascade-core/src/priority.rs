//! Scheduling tiers and queued work items.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{ActionId, ObjectId, ObserverId};

/// Ordering rank used to sequence re-evaluation.
///
/// Declaration order is processing order. The first three tiers are drained
/// inside every micro-cycle. The remaining tiers defer work: picking a tier
/// refreshes its start snapshot and those of every tier before it, so work
/// deferred to `Outer` only runs after all `Inner` work has settled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    One,
    Scheduled,
    Forward,
    Inner,
    Three,
    Four,
    Outer,
    Deferred,
    Construction,
    Backward,
}

impl Priority {
    pub const ALL: [Priority; 10] = [
        Priority::One,
        Priority::Scheduled,
        Priority::Forward,
        Priority::Inner,
        Priority::Three,
        Priority::Four,
        Priority::Outer,
        Priority::Deferred,
        Priority::Construction,
        Priority::Backward,
    ];

    /// Tiers drained within a micro-cycle.
    pub const IMMEDIATE: [Priority; 3] = [Priority::One, Priority::Scheduled, Priority::Forward];

    /// Tiers that defer work past the current micro-cycle.
    pub const DEFERRING: [Priority; 7] = [
        Priority::Inner,
        Priority::Three,
        Priority::Four,
        Priority::Outer,
        Priority::Deferred,
        Priority::Construction,
        Priority::Backward,
    ];

    pub fn is_immediate(self) -> bool {
        self <= Priority::Forward
    }

    /// Position among the deferring tiers.
    pub fn deferral_index(self) -> Option<usize> {
        Self::DEFERRING.iter().position(|p| *p == self)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::One => "one",
            Priority::Scheduled => "scheduled",
            Priority::Forward => "forward",
            Priority::Inner => "inner",
            Priority::Three => "three",
            Priority::Four => "four",
            Priority::Outer => "outer",
            Priority::Deferred => "deferred",
            Priority::Construction => "construction",
            Priority::Backward => "backward",
        };
        f.write_str(name)
    }
}

/// Direction in which an observer propagates.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    /// Tier at which readers in this direction are triggered.
    pub fn priority(self) -> Priority {
        match self {
            Direction::Forward => Priority::Forward,
            Direction::Backward => Priority::Backward,
        }
    }
}

/// The unit of work a queue entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeafRef {
    Observer(ObserverId),
    Action(ActionId),
}

/// A leaf queued against a target object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Queued {
    pub target: ObjectId,
    pub leaf: LeafRef,
}

impl Queued {
    pub fn observer(target: ObjectId, observer: ObserverId) -> Self {
        Self {
            target,
            leaf: LeafRef::Observer(observer),
        }
    }

    pub fn action(target: ObjectId, action: ActionId) -> Self {
        Self {
            target,
            leaf: LeafRef::Action(action),
        }
    }
}

//! Transactional scheduler that drives cascade observers to a fixed point.
//!
//! A [`UniverseTransaction`] owns the authoritative [`State`] and a queue of
//! actions. Each action runs as a transaction; every observer whose inputs
//! changed re-runs until nothing changes any more, and only then is the new
//! state published.
//!
//! ## Core Concepts
//!
//! - **Action**: an external write submitted with [`UniverseTransaction::put`]
//! - **Observer run**: re-executes a rule, records what it read, writes results
//! - **Micro-cycle**: all leaves queued at one tier, run in parallel, merged
//! - **Ripple-out**: a write that would undo an open cycle is deferred to a later tier
//! - **Matching**: derived objects that turn out to be the same are merged
//! - **Imperative**: a two-way bridge to outside code on its own scheduler
//!
//! ## Settling an Action
//!
//! ```text
//! put(action)
//!   └─ Scheduled: action body
//!        └─ One / Forward: triggered observers, repeated until quiet
//!             └─ Inner … Backward: deferred observers, one tier at a time
//!                  └─ orphan clearing
//!                       └─ consistency check ─▶ history, status, imperatives
//! ```
//!
//! ## Features
//!
//! - `tokio` - [`TokioScheduler`] for imperatives living on a tokio runtime

mod context;
mod imperative;
mod json;
mod objects;
mod stats;
mod status;
mod transaction;
mod universe;

pub use cascade_core::*;

#[cfg(feature = "tokio")]
pub use imperative::TokioScheduler;
pub use imperative::{
    Delta, DeltaHandler, ImperativeTransaction, InlineScheduler, Job, Scheduler, ThreadScheduler,
};
pub use json::{StateJson, NULL_REF};
pub use objects::{ObjectMeta, ObjectTable};
pub use stats::StatsSnapshot;
pub use status::{Mood, Status, StatusProvider};
pub use transaction::{Action, ActionFn, Derivation, Transaction, TransactionKind};
pub use universe::UniverseTransaction;

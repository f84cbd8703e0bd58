//! Persistent state model and declarations for the cascade reactive engine.
//!
//! This crate holds everything a transaction reads or writes but none of the
//! scheduling: values, object handles, the versioned [`State`], the
//! [`Registry`] of properties, classes and observers, and the construction
//! records used to reconcile derived objects.
//!
//! ## Core Concepts
//!
//! - **State**: immutable snapshot `(object, slot) -> cell`, structurally shared
//! - **Setable / Observed / Constant**: the three property kinds
//! - **Class**: the properties and observers an object supports
//! - **Newable**: an object whose identity is derived and reconciled
//! - **Reason / Construction**: why a newable exists, and who asked for it
//! - **Leaf**: the transaction interface observer and action bodies use
//!
//! ## The State Model
//!
//! ```text
//! State = {
//!     objects: OrdMap<ObjectId, {
//!         cells: OrdMap<Slot, Cell>,   // Property(p) -> Value, plus bookkeeping
//!     }>,
//! }
//! ```
//!
//! Every write produces a new `State`; older snapshots stay valid and are kept
//! by the scheduler for time travel.

mod class;
mod config;
mod construction;
mod error;
mod ids;
mod leaf;
mod observer;
mod priority;
mod property;
mod registry;
mod state;
mod trace;
mod value;

pub use class::{ClassSpec, IdentityFn, NewableSpec};
pub use config::EngineConfig;
pub use construction::{Construction, Origin, Reason, ReasonField};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use ids::{ActionId, ClassId, ObjectId, ObserverId, PropertyId};
pub use leaf::Leaf;
pub use observer::{FnObserver, Observer, ObserverSpec};
pub use priority::{Direction, LeafRef, Priority, Queued};
pub use property::{ChangeHook, ConsistencyCheck, ConstantDeriver, PropertyKind, PropertySpec};
pub use registry::{Registry, RegistryBuilder};
pub use state::{
    Cell, Change, Containing, Dependencies, Diff, Observee, PropertyChange, Reader, Slot, State,
};
pub use trace::{ObserverTrace, TracedValue};
pub use value::Value;

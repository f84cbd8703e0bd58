//! Error types for the engine.

use std::cmp::Ordering;

use thiserror::Error;

use crate::ids::{ClassId, ObjectId, ObserverId, PropertyId};

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse classification used for escalation and reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// Stops the offending observer and aborts the state transition.
    Consistency,
    /// A runaway guard fired.
    Resource,
    /// A mandatory value ended up empty.
    NullRequired,
    /// A constant read reactive state while initializing.
    NonDeterministic,
    /// Anything else; kills the engine.
    Fatal,
}

/// Errors that can occur while running the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A consistency predicate rejected a value.
    #[error("consistency violation on {object}.{property}: {message}")]
    Consistency {
        object: ObjectId,
        property: String,
        message: String,
    },

    /// A mandatory property is empty after a cycle.
    #[error("required value missing: {object}.{property}")]
    NullRequired { object: ObjectId, property: String },

    /// An observer wrote an empty mandatory value after reading one.
    ///
    /// Raised inside the run and swallowed by the observer transaction.
    #[error("empty mandatory value written to {object}.{property}")]
    EmptyMandatory { object: ObjectId, property: String },

    #[error("{observer} on {object} observes {count} values (limit {limit})")]
    TooManyObserved {
        object: ObjectId,
        observer: String,
        count: usize,
        limit: usize,
    },

    #[error("{property} on {object} has {count} observers (limit {limit})")]
    TooManyObservers {
        object: ObjectId,
        property: String,
        count: usize,
        limit: usize,
    },

    #[error("{observer} on {object} changed {count} times in one transaction\n{trace}")]
    TooManyChanges {
        object: ObjectId,
        observer: String,
        count: u32,
        trace: String,
    },

    /// Reactive state was read while a constant was initializing.
    #[error("read of {property} on {object} while constant {constant} initializes")]
    NonDeterministic {
        object: ObjectId,
        property: String,
        constant: String,
    },

    /// An orphan still carries user state after a cycle.
    #[error("orphan {object} still holds state: {properties}")]
    OrphanState { object: ObjectId, properties: String },

    /// An observer body failed.
    #[error("{observer} failed on {object}: {message}")]
    ObserverFailed {
        object: ObjectId,
        observer: String,
        message: String,
    },

    /// An action body failed.
    #[error("action {action} failed: {message}")]
    ActionFailed { action: String, message: String },

    /// A leaf transaction was opened while already open.
    #[error("{kind} transaction for {target} reopened while running")]
    Reopened { kind: String, target: ObjectId },

    /// Imperative ordering declarations form a cycle.
    #[error("imperative ordering cycle: {path}")]
    OrderingCycle { path: String },

    #[error("unknown property: {0}")]
    UnknownProperty(PropertyId),

    #[error("unknown class: {0}")]
    UnknownClass(ClassId),

    #[error("unknown observer: {0}")]
    UnknownObserver(ObserverId),

    #[error("unknown object: {0}")]
    UnknownObject(ObjectId),

    /// Invalid registry declaration.
    #[error("invalid registry: {message}")]
    InvalidRegistry { message: String },

    /// The engine was killed and no longer accepts work.
    #[error("engine killed")]
    Killed,

    /// Error raised by user code.
    #[error("{message}")]
    Failed { message: String },

    #[error("json error: {message}")]
    Json { message: String },
}

impl EngineError {
    /// Convenience constructor for user-raised errors.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Consistency { .. } | EngineError::OrphanState { .. } => {
                ErrorKind::Consistency
            }
            EngineError::TooManyObserved { .. }
            | EngineError::TooManyObservers { .. }
            | EngineError::TooManyChanges { .. } => ErrorKind::Resource,
            EngineError::NullRequired { .. } | EngineError::EmptyMandatory { .. } => {
                ErrorKind::NullRequired
            }
            EngineError::NonDeterministic { .. } => ErrorKind::NonDeterministic,
            _ => ErrorKind::Fatal,
        }
    }

    /// Errors that permanently stop the observer raising them.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Consistency | ErrorKind::Resource | ErrorKind::NonDeterministic
        )
    }

    /// Reporting order: consistency errors first, then a stable textual order.
    pub fn report_order(&self, other: &Self) -> Ordering {
        other
            .is_consistency()
            .cmp(&self.is_consistency())
            .then_with(|| self.kind().cmp(&other.kind()))
            .then_with(|| self.to_string().cmp(&other.to_string()))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_order_puts_consistency_first() {
        let fatal = EngineError::failed("boom");
        let resource = EngineError::TooManyChanges {
            object: ObjectId(1),
            observer: "toggle".into(),
            count: 40,
            trace: String::new(),
        };
        let mut errors = vec![fatal.clone(), resource.clone()];
        errors.sort_by(EngineError::report_order);
        assert_eq!(errors, vec![resource, fatal]);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(EngineError::Killed.kind(), ErrorKind::Fatal);
        assert!(EngineError::OrphanState {
            object: ObjectId(3),
            properties: "name".into()
        }
        .is_consistency());
        assert!(!EngineError::NullRequired {
            object: ObjectId(3),
            property: "name".into()
        }
        .is_consistency());
    }
}

use crate::state_machine::RequestState;
use crate::store::StoreError;
use crate::types::AbilitySet;
use graphop_schema::{ModelRef, SchemaError};
use serde::Serialize;
use std::fmt;

/// Failures of planning, validation and execution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The plan is sound but the actor lacks abilities
    #[error("policy violation: {0}")]
    PolicyViolation(ViolationReport),

    /// The graph cannot be processed as requested
    #[error("graph inconsistency: {0}")]
    Inconsistency(#[from] Inconsistency),

    /// Rejected before traversal
    #[error("bad input: {0}")]
    BadInput(String),

    /// A store call failed
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    /// Misuse of a single-use component or an illegal transition
    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl GraphError {
    /// Stable classification for transports
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            GraphError::Inconsistency(_) => ErrorKind::GraphInconsistency,
            GraphError::BadInput(_) => ErrorKind::BadInput,
            GraphError::Store(_) => ErrorKind::StoreFailure,
            GraphError::IllegalState(_) => ErrorKind::IllegalState,
        }
    }

    /// Nothing is retried by the engine; the caller decides
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }

    pub(crate) fn bad_input(message: impl Into<String>) -> Self {
        GraphError::BadInput(message.into())
    }
}

impl From<SchemaError> for GraphError {
    fn from(value: SchemaError) -> Self {
        GraphError::BadInput(value.to_string())
    }
}

/// Error families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing abilities
    PolicyViolation,
    /// Fatal graph shape problem
    GraphInconsistency,
    /// Invalid request
    BadInput,
    /// Store write or read failed
    StoreFailure,
    /// Illegal state
    IllegalState,
}

impl ErrorKind {
    /// Code string used in responses
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::GraphInconsistency => "graph_inconsistency",
            ErrorKind::BadInput => "bad_input",
            ErrorKind::StoreFailure => "store_failure",
            ErrorKind::IllegalState => "illegal_state",
        }
    }
}

/// Fatal graph shapes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Inconsistency {
    /// Duplicates that can only be persisted after each other
    #[error("cyclic model graph: {} duplicates block each other", members.len())]
    CyclicDuplication {
        /// Originals whose duplicates are stuck
        members: Vec<ModelRef>,
    },

    /// Deleted objects holding non-nullable links to each other in a loop
    #[error("deletion order has a cycle through {at}")]
    DeletionCycle {
        /// One object on the cycle
        at: ModelRef,
    },

    /// A surviving object holds a link to a deleted or moved object that may not be severed
    #[error("{holder} cannot release {target}: {property} may not be severed")]
    UnseverableLink {
        /// Object holding the link
        holder: ModelRef,
        /// Property name
        property: String,
        /// Referenced object
        target: ModelRef,
    },

    /// A duplicate would need a non-nullable link to an ignored class
    #[error("{holder}.{property} is not nullable but {target} is ignored")]
    IgnoredNonNullable {
        /// Original holding the link
        holder: ModelRef,
        /// Property name
        property: String,
        /// Ignored target
        target: ModelRef,
    },

    /// Review passes did not converge
    #[error("no fixpoint after {passes} passes")]
    FixpointNotReached {
        /// Passes run
        passes: usize,
    },
}

/// One object the actor may not process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Class name
    pub class: String,
    /// Object id
    pub id: u64,
    /// Abilities the verdict needs
    pub required: AbilitySet,
}

/// Every object the actor may not process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViolationReport {
    /// Offending objects in discovery order
    pub violations: Vec<Violation>,
}

impl ViolationReport {
    /// Whether nothing was reported
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Number of offending objects
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.len()
    }
}

impl fmt::Display for ViolationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} object(s) lack required abilities", self.violations.len())?;
        if let Some(first) = self.violations.first() {
            write!(f, " (first: {}:{})", first.class, first.id)?;
        }
        Ok(())
    }
}

/// A step failure, tagged with where it happened
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step {step} ({state}) failed: {error}")]
pub struct RequestFailure {
    /// Zero-based step index
    pub step: usize,
    /// State whose handler failed
    pub state: RequestState,
    /// Cause
    #[source]
    pub error: GraphError,
}

impl RequestFailure {
    /// Failure family of the cause
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

use crate::error::GraphError;
use serde::Serialize;
use std::fmt;

/// Lifecycle of one operation request
///
/// Each non-terminal state names the step that runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Compute the plan
    Planning,
    /// Check for policy violations
    Validating,
    /// Materialize the processor and executors
    Processing,
    /// Sever links
    Unlinking,
    /// Delete, mutate or persist duplicates
    Executing,
    /// Finished; the response is available
    Done,
    /// A step failed
    Failed,
    /// Stopped by the caller between steps
    Cancelled,
}

impl RequestState {
    /// Whether no further step can run
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Planning => "planning",
            RequestState::Validating => "validating",
            RequestState::Processing => "processing",
            RequestState::Unlinking => "unlinking",
            RequestState::Executing => "executing",
            RequestState::Done => "done",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Validates a state transition.
///
/// Illegal transitions panic under the `strict-debug` feature so misuse shows
/// up in tests; otherwise they are reported as [`GraphError::IllegalState`].
pub fn validate_transition(from: RequestState, to: RequestState) -> Result<(), GraphError> {
    if allowed(from, to) {
        Ok(())
    } else {
        assert!(
            !cfg!(feature = "strict-debug"),
            "Illegal request transition attempted: {from:?} -> {to:?}"
        );
        Err(GraphError::IllegalState(format!(
            "request cannot move from {from} to {to}"
        )))
    }
}

/// States reachable from `from` in one transition
#[must_use]
pub fn allowed_transitions(from: RequestState) -> Vec<RequestState> {
    use RequestState::*;
    match from {
        Planning => vec![Validating, Failed, Cancelled],
        Validating => vec![Processing, Failed, Cancelled],
        Processing => vec![Unlinking, Failed, Cancelled],
        Unlinking => vec![Executing, Failed, Cancelled],
        Executing => vec![Done, Failed, Cancelled],
        Done | Failed | Cancelled => vec![],
    }
}

fn allowed(from: RequestState, to: RequestState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_linear() {
        use RequestState::*;
        let path = [Planning, Validating, Processing, Unlinking, Executing, Done];
        for pair in path.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok());
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(RequestState::Done.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(RequestState::Cancelled.is_terminal());
        assert!(!RequestState::Planning.is_terminal());
    }

    #[cfg(not(feature = "strict-debug"))]
    #[test]
    fn skipping_a_step_is_rejected() {
        let err = validate_transition(RequestState::Planning, RequestState::Executing).unwrap_err();
        assert!(matches!(err, GraphError::IllegalState(_)));
    }
}

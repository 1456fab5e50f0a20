//! Shared error taxonomy. Component-specific errors live beside their component;
//! this module only holds the cross-cutting failure classification used by the
//! circuit breaker and by anything that needs to decide whether to retry.

use thiserror::Error;

/// Classification from the error-handling design: drives retry policy and
/// whether a failure counts toward a venue's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Validation,
    Policy,
    Transient,
    Permanent,
    Invariant,
    Timeout,
}

impl FailureClass {
    /// Timeouts are transient for the purposes of submission retries and the
    /// circuit breaker, but callers querying status should treat them as unknown.
    pub fn counts_toward_circuit_breaker(self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::Timeout)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    pub fn class(&self) -> FailureClass {
        match self {
            CoreError::Validation(_) => FailureClass::Validation,
            CoreError::Invariant(_) => FailureClass::Invariant,
        }
    }
}

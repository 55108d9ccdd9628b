//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `orca-rs`.
pub type OrcaResult<T> = Result<T, OrcaError>;

/// High-level error categories for the connection core.
///
/// Protocol errors are fatal for the offending connection, never for the process. Invariant
/// violations (lock misuse, reply-byte accounting) are asserted instead of surfaced here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrcaError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Client payload violates the wire protocol framing rules.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket or poller I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::OrcaError;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn protocol_error_message_carries_wire_prefix() {
        let error = OrcaError::Protocol("invalid bulk length".to_owned());
        assert_that!(
            format!("{error}"),
            eq("Protocol error: invalid bulk length")
        );
    }
}

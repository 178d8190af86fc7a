// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type UrnResult<T> = Result<T, UrnError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UrnError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown factor: {0}")]
    UnknownFactor(String),

    #[error("duplicate participant id: {0}")]
    DuplicateParticipantId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("incompatible rng state: {0}")]
    IncompatibleRngState(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("cannot choose from an empty set")]
    EmptyChoice,
}

/// Coarse classification used by callers that map errors to exit codes or
/// retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller input was rejected; nothing was written.
    Validation,
    /// The participant or configuration store failed.
    Storage,
    /// The study cannot continue reproducibly, or an internal invariant broke.
    Fatal,
}

impl UrnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::UnknownFactor(_)
            | Self::DuplicateParticipantId(_)
            | Self::NotFound(_) => ErrorKind::Validation,
            Self::Storage(_) => ErrorKind::Storage,
            Self::IncompatibleRngState(_) | Self::EmptyChoice => ErrorKind::Fatal,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        Self::Storage(format!("{context}: {err}"))
    }
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Storage => "STORAGE",
            Self::Fatal => "FATAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_id_is_recoverable_by_the_caller() {
        let err = UrnError::DuplicateParticipantId("p1".into());
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "duplicate participant id: p1");
    }

    #[test]
    fn rng_and_choice_failures_are_fatal() {
        assert_eq!(
            UrnError::IncompatibleRngState("bad magic".into()).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(UrnError::EmptyChoice.kind(), ErrorKind::Fatal);
        assert_eq!(UrnError::Storage("disk".into()).kind().as_str(), "STORAGE");
    }
}

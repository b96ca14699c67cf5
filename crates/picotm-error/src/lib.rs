//! Structured error value shared by every picotm module.
//!
//! Mirrors the taxonomy a module writes into on failure: a conflicting
//! access, a recoverable syscall-style errno, a structural error code, or a
//! kernel return code. The state machine in `picotm-core` inspects
//! [`PicotmError::kind`] to decide whether to retry, restart, escalate to
//! irrevocable mode, or propagate to the caller.

use std::fmt;

pub type Result<T> = std::result::Result<T, PicotmError>;

/// A handle identifying the resource a conflicting access occurred on.
///
/// Opaque beyond equality/debug: modules attach whatever identifies the
/// contended resource (a frame's block index, a file-table object id) for
/// diagnostics; the state machine itself never inspects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConflictHandle(pub u64);

/// Structural, usually non-recoverable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("out of memory")]
    OutOfMemory,
    #[error("general error")]
    GeneralError,
    #[error("invalid file descriptor")]
    InvalidFd,
    #[error("kernel returned an error")]
    KernRet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoError,
    Errno(i32),
    ErrorCode(ErrorCode),
    KernelCode(i32),
    Conflicting(Option<ConflictHandle>),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoError => write!(f, "no error"),
            Self::Errno(errno) => write!(f, "errno {errno}"),
            Self::ErrorCode(code) => write!(f, "{code}"),
            Self::KernelCode(code) => write!(f, "kernel code {code}"),
            Self::Conflicting(Some(handle)) => {
                write!(f, "conflicting access on resource {}", handle.0)
            }
            Self::Conflicting(None) => write!(f, "conflicting access"),
        }
    }
}

/// The structured failure descriptor carried on every fallible operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct PicotmError {
    kind: ErrorKind,
    non_recoverable: bool,
    message: Option<String>,
}

impl PicotmError {
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, non_recoverable: false, message: None }
    }

    #[must_use]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, non_recoverable: false, message: Some(message.into()) }
    }

    /// Ad hoc non-recoverable failure, for conditions that do not fit the
    /// module taxonomy (internal invariant violations, setup failures).
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ErrorCode(ErrorCode::GeneralError),
            non_recoverable: true,
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn errno(errno: i32) -> Self {
        Self::new(ErrorKind::Errno(errno))
    }

    #[must_use]
    pub fn conflicting(handle: Option<ConflictHandle>) -> Self {
        Self::new(ErrorKind::Conflicting(handle))
    }

    #[must_use]
    pub fn mark_non_recoverable(mut self) -> Self {
        self.non_recoverable = true;
        self
    }

    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[must_use]
    pub const fn is_conflicting(&self) -> bool {
        matches!(self.kind, ErrorKind::Conflicting(_))
    }

    #[must_use]
    pub const fn is_non_recoverable(&self) -> bool {
        self.non_recoverable
    }

    /// The errno value this error would present to the application, if any.
    #[must_use]
    pub const fn as_errno(&self) -> Option<i32> {
        match self.kind {
            ErrorKind::Errno(errno) => Some(errno),
            ErrorKind::ErrorCode(ErrorCode::OutOfMemory) => Some(libc::ENOMEM),
            ErrorKind::ErrorCode(ErrorCode::InvalidFd) => Some(libc::EBADF),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_without_handle_is_conflicting() {
        let err = PicotmError::conflicting(None);
        assert!(err.is_conflicting());
        assert!(!err.is_non_recoverable());
    }

    #[test]
    fn internal_errors_are_non_recoverable() {
        let err = PicotmError::internal("registry full");
        assert!(err.is_non_recoverable());
        assert!(!err.is_conflicting());
        assert_eq!(err.to_string(), "general error: registry full");
    }

    #[test]
    fn errno_round_trips_through_as_errno() {
        let err = PicotmError::errno(libc::ERANGE);
        assert_eq!(err.as_errno(), Some(libc::ERANGE));
    }

    #[test]
    fn out_of_memory_reports_enomem() {
        let err = PicotmError::new(ErrorKind::ErrorCode(ErrorCode::OutOfMemory));
        assert_eq!(err.as_errno(), Some(libc::ENOMEM));
    }
}

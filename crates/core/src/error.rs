//! Error model shared by all services.
//!
//! Every failure is classified into one [`ErrorKind`]. Callers decide what a
//! kind means for them: the bus consumer advances past `BadInput`, retries
//! `Internal`, and most handlers treat `NotFound` as a no-op.

use thiserror::Error;

/// Result type used across the services.
pub type Result<T> = core::result::Result<T, Error>;

/// Classification of a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed message or request.
    BadInput,
    /// A referenced entity does not exist.
    NotFound,
    /// The caller could not be authenticated.
    Unauthorized,
    /// The caller is authenticated but lacks a permission.
    Forbidden,
    /// Transient DB / bus / search failure; retried by the outer loop.
    Internal,
    /// Unrecoverable invariant violation.
    Fatal,
}

impl ErrorKind {
    /// Stable machine-readable code used in websocket and HTTP error bodies.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::BadInput => "bad-input",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Internal => "internal",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

/// Service-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    details: Vec<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadInput, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, msg)
    }

    /// Attach an additional detail (e.g. a rollback failure) without changing the kind.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &[String] {
        &self.details
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_bad_input(&self) -> bool {
        self.kind == ErrorKind::BadInput
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::bad_input(format!("invalid json: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_keep_kind_and_message() {
        let err = Error::internal("commit failed").with_detail("rollback: connection reset");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.message(), "commit failed");
        assert_eq!(err.details(), ["rollback: connection reset".to_string()]);
        assert_eq!(err.to_string(), "internal: commit failed");
    }

    #[test]
    fn json_errors_are_bad_input() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(err.is_bad_input());
    }
}

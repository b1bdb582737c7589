//! Error types for tether.
//!
//! Errors here are the *synchronous* failures of the API surface: conditions
//! reported by return value at the call site. Failures of running children
//! (panics, asynchronous interrupts) are a different animal and live in
//! [`crate::signal::Failure`].
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - An error carries optional context text and an optional source chain

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The scope has been closed; no further children may be spawned.
    ScopeClosed,
    /// The operating system refused to create a worker thread.
    WorkerSpawn,
}

impl ErrorKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ScopeClosed => "scope closed",
            Self::WorkerSpawn => "worker thread creation failed",
        }
    }
}

/// The error type for tether operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error reports a spawn attempt on a closed scope.
    #[must_use]
    pub const fn is_scope_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::ScopeClosed)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

/// A specialized result type for tether operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_accessor() {
        let err = Error::new(ErrorKind::ScopeClosed);
        assert_eq!(err.kind(), ErrorKind::ScopeClosed);
        assert!(err.is_scope_closed());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::ScopeClosed).with_context("spawn after close");
        let rendered = err.to_string();
        assert!(rendered.contains("scope closed"));
        assert!(rendered.contains("spawn after close"));
    }

    #[test]
    fn source_is_chained() {
        let io = std::io::Error::other("EAGAIN");
        let err = Error::new(ErrorKind::WorkerSpawn).with_source(io);
        assert!(std::error::Error::source(&err).is_some());
    }
}

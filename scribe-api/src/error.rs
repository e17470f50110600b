//! The error type shared by the API, render, and sync layers.
//!
//! Failure policy is decided by variant, never by string-matching messages.
//! Every cross-boundary error wraps its cause; the layer that creates the
//! error adds a one-line context prefix. Print with `{err:#}`-style anyhow
//! chains at the binary layer.

use std::fmt;

use thiserror::Error;

/// Boxed source for variants whose cause can come from several libraries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    /// The caller handed us something unusable (e.g. a malformed one-time
    /// code). Not retryable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The cloud rejected our credentials. Aborts the current run; the
    /// daemon retries on the next tick.
    #[error("auth: {0}")]
    Auth(String),

    /// Failed to talk to the remote side (DNS, TLS, timeout, 5xx). The only
    /// transient kind; bounded retries are the caller's concern.
    #[error("transport: {ctx}")]
    Transport {
        ctx: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The requested entity does not exist remotely.
    #[error("not found: {0}")]
    NotFound(String),

    /// Local filesystem failure.
    #[error("{ctx}")]
    Io {
        ctx: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed data: token claims, archive manifests, wire JSON.
    #[error("parse: {ctx}")]
    Parse {
        ctx: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The remote side understood the request and refused it (4xx other
    /// than auth/not-found).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The operation observed a cancellation signal. Not a failure; the
    /// orchestrator finalizes its result when it sees this.
    #[error("cancelled")]
    Cancelled,

    /// The remote folder tree revisited a node while ascending parents.
    #[error("circular folder hierarchy at node {0}")]
    CircularHierarchy(String),

    /// Structural failure for one document (path traversal, unusable
    /// archive). Never retried until the remote version changes.
    #[error("{ctx}")]
    Fatal {
        ctx: String,
        #[source]
        source: Option<BoxError>,
    },
}

/// Fieldless mirror of [`Error`] for policy decisions and assertions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    InvalidInput,
    Auth,
    Transport,
    NotFound,
    Io,
    Parse,
    Rejected,
    Cancelled,
    CircularHierarchy,
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::Io,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::CircularHierarchy(_) => ErrorKind::CircularHierarchy,
            Self::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether retrying the same operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    // --- constructors adding a one-line context prefix --- //

    pub fn transport(
        ctx: impl fmt::Display,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Transport {
            ctx: ctx.to_string(),
            source: Some(source.into()),
        }
    }

    pub fn io(ctx: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            ctx: ctx.to_string(),
            source,
        }
    }

    pub fn parse(ctx: impl fmt::Display, source: impl Into<BoxError>) -> Self {
        Self::Parse {
            ctx: ctx.to_string(),
            source: Some(source.into()),
        }
    }

    pub fn parse_msg(ctx: impl fmt::Display) -> Self {
        Self::Parse {
            ctx: ctx.to_string(),
            source: None,
        }
    }

    pub fn fatal(ctx: impl fmt::Display) -> Self {
        Self::Fatal {
            ctx: ctx.to_string(),
            source: None,
        }
    }
}

use std::fmt;

/// Coarse error taxonomy shared by every subsystem in this crate family.
///
/// These are *kinds*, not a hierarchy of exception types: callers match on
/// `ErrorKind` to decide retry/backoff/terminal behavior, the way the
/// dispatcher in `coord-dispatcher` maps a handler outcome to a store
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Null/empty resource name, unknown router key, malformed cron.
    InvalidArgument,
    /// Database unavailable, connection refused, timeout: caller may retry.
    Transient,
    /// Handler declared the message unrecoverable.
    PermanentHandlerFailure,
    /// Handler threw or signalled retry.
    TransientHandlerFailure,
    /// A lease was not renewed in time.
    LeaseLost,
    /// Rejected at wiring time; never expected to surface at runtime.
    OptionsValidation,
    /// Router lookup by a key with no registered store.
    NotFound,
    /// Anything not otherwise classified.
    Other,
}

/// The crate-wide error type. Wraps [`anyhow::Error`] the way the teacher's
/// `trace_core::Error` does, plus a classification used for dispatcher
/// outcome routing.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: anyhow::Error,
}

impl Error {
    pub fn new(kind: ErrorKind, inner: anyhow::Error) -> Self {
        Self { kind, inner }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, anyhow::anyhow!(msg.into()))
    }

    pub fn lease_lost(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::LeaseLost, anyhow::anyhow!(msg.into()))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, anyhow::anyhow!(msg.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(inner: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Other,
            inner,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => ErrorKind::Transient,
            _ => ErrorKind::Other,
        };
        Self {
            kind,
            inner: anyhow::Error::new(err),
        }
    }
}

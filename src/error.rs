//! Error types for the tailing library.

use std::sync::Arc;

use thiserror::Error;

/// Message carried by the in-band diagnostic line emitted when the rate
/// limiter rejects a pour.
pub(crate) const RATE_LIMIT_MESSAGE: &str =
    "Too much log activity; waiting a second before resuming tailing";

/// The main error type for tailing operations.
///
/// `Io` and `Watcher` wrap their sources in [`Arc`] so the whole enum stays
/// `Clone`: a terminal error is delivered both in-band on the final
/// [`Line`](crate::Line) and through [`Tail::err`](crate::Tail::err).
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Invalid option combinations, rejected at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O errors from opening, seeking or reading the file.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// File watching errors from the notify crate.
    #[error("file watcher error: {0}")]
    Watcher(#[source] Arc<notify::Error>),

    /// The rate limiter rejected a pour. Informational; never terminal.
    #[error("{}", RATE_LIMIT_MESSAGE)]
    RateLimited,

    /// Cooperative stop. Reported by [`Tail::err`](crate::Tail::err) after
    /// [`Tail::stop`](crate::Tail::stop); not a failure.
    #[error("tail stopped")]
    Stopped,

    /// The engine has exited and the file is closed.
    #[error("file is closed")]
    Closed,

    /// No bucket stored under the requested key.
    #[error("no bucket for key: {key}")]
    BucketNotFound { key: String },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Watcher(Arc::new(err))
    }
}

/// A convenient Result type for tailing operations.
pub type Result<T> = std::result::Result<T, Error>;

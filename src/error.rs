//! Unified error type.

use thiserror::Error;

/// The error type returned by kiln's fallible operations.
///
/// Application-level failures (401, 403, 404, ...) are expressed as
/// normalised envelopes, not as `Error`s. This type surfaces infrastructure
/// failures: loading configuration, binding the listener, talking to the
/// discovery agent, opening or closing auxiliary resources.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but is semantically unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid path pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: matchit::InsertError,
    },

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// An upstream answered with a status the caller treats as failure.
    #[error("{service} answered {status}")]
    Upstream { service: &'static str, status: u16 },

    /// An auxiliary resource could not be opened or closed.
    #[error("resource `{name}`: {source}")]
    Resource {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("lifecycle hook `{hook}` failed: {source}")]
    Hook {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// `init` was called again after a failed boot.
    #[error("application already failed to boot")]
    BootFailed,

    /// `init` was called after `shutdown`.
    #[error("application has been shut down")]
    ShutDown,
}

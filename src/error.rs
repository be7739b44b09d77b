use crate::protocol;

/// Errors that end a scan.
///
/// Timeouts and replies that do not match the signature are not errors, they
/// are reported as probe outcomes. Only validation problems and an exhausted
/// retry budget surface here.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `protocol::Error`.
    #[error(transparent)]
    Protocol(#[from] protocol::Error),

    /// The connection failed more often than the retry budget allows.
    #[error("aborting after {failures} failed connection attempts to {host}:{port}: {source}")]
    RetryBudgetExhausted {
        host: String,
        port: u16,
        failures: u32,
        #[source]
        source: std::io::Error,
    },
}

/// The result type for scanner operations.
pub type Result<T> = std::result::Result<T, Error>;

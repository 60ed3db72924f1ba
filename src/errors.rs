//! Error kinds crossing the supervisor/controller boundary.

use thiserror::Error;

/// Failures the prewarm subsystem can surface to its callers.
///
/// Per-child failures never tear down the supervisor; failures on the
/// control pipe pair are fatal on both sides.
#[derive(Debug, Error)]
pub enum PrewarmError {
    /// The named shared-memory region could not be opened or mapped.
    #[error("shared memory region {name} cannot be mapped: {source}")]
    ShmMissing { name: String, source: std::io::Error },

    /// The recorded payload size exceeds the region length.
    #[error("shared memory region {name} is truncated: need {need} bytes, region holds {have}")]
    ShmTruncated {
        name: String,
        need: usize,
        have: usize,
    },

    /// The request fingerprint is not valid JSON.
    #[error("request payload is not valid JSON: {0}")]
    DecodeFailed(#[from] serde_json::Error),

    /// Malformed frame, unknown command, non-UTF-8 input.
    #[error("malformed frame: {0}")]
    Protocol(String),

    /// The supervisor replied with an ERR: frame.
    #[error("fork rejected: {0}")]
    ForkRejected(String),

    /// No CHILD:/ERR: reply arrived within the fork budget.
    #[error("timed out waiting for a fork reply")]
    ForkTimedOut,

    /// A bounded write to the supervisor did not drain in time.
    #[error("timed out writing to the prewarm process")]
    WriteTimedOut,

    /// POLLERR/POLLHUP/POLLNVAL on a control pipe.
    #[error("control pipe to the prewarm process failed")]
    PipeBroken,

    /// The forked child never wrote its acknowledgement byte.
    #[error("forked child failed the pipe handshake")]
    ForkHandshakeFailed,
}

use thiserror::Error;

/// Errors surfaced by the probing core.
///
/// Per-probe outcomes (timeouts, unreachable destinations) are not errors; they
/// travel as [`crate::state::PingStatus`] values inside results.
#[derive(Debug, Error)]
pub enum Error {
    /// No raw-socket privilege, socket creation failed, or the external probe
    /// utility could not be spawned. Fatal to `start()`.
    #[error("probe backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A configuration value is outside its accepted bounds.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// An inbound packet failed validation. Logged and dropped, never returned
    /// from a public operation.
    #[error("malformed reply: {0}")]
    MalformedReply(&'static str),

    /// A host name did not resolve to an address of the configured IP version.
    #[error("cannot resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// The engine must be started before this operation.
    #[error("engine is not running")]
    NotRunning,

    /// Transmitting a probe failed.
    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),

    /// A persisted settings record could not be read or written.
    #[error("settings record: {0}")]
    Settings(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

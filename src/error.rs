//! # Error Types
//!
//! Two narrow error enums, matching the error-handling policy of the
//! forwarding engine: configuration mistakes are fatal at startup,
//! everything else is handled locally and never propagates past the
//! dispatch boundary (see `dispatcher` and `destination`).

use thiserror::Error;

/// Errors raised while building and validating a [`crate::config::ForwardingConfig`].
///
/// All of these are startup-time failures; the caller is expected to abort
/// initialization rather than attempt to recover.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown distribution mode '{0}', expected 'all' or 'roundrobin'")]
    InvalidDistribution(String),

    #[error("no destinations configured, at least one is required")]
    NoDestinations,

    #[error("packet_size {0} out of range, must be within [256, 65535]")]
    PacketSizeOutOfRange(u16),

    #[error("reconnection_period must be greater than zero")]
    InvalidReconnectionPeriod,

    #[error("failed to read configuration file '{path}': {source}")]
    ConfigFileRead { path: String, source: std::io::Error },

    #[error("failed to parse configuration file '{path}': {source}")]
    ConfigFileParse { path: String, source: serde_json::Error },
}

/// Fatal errors raised only while wiring up a [`crate::ForwardingDispatcher`].
///
/// Everything else in the engine (protocol errors, capacity exhaustion,
/// sender BUSY/CLOSED, recoverable allocation failures) is reported through
/// `tracing` and a local status value, never through this type.
#[derive(Debug, Error)]
pub enum ForwardingError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to construct destination for '{host}:{port}'")]
    DestinationSetup { host: String, port: String },
}

//! Error types for directory delegate operations.
//!
//! The taxonomy distinguishes transient transport failures (which drive
//! server failover), credential and lookup failures (surfaced to the
//! caller), and the referral family handled internally by the delegate.

use thiserror::Error;

/// Main error type for directory operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Delegate configuration is unusable, e.g. no servers defined
    #[error("Configuration error: {0}")]
    Config(String),

    /// Every configured server was tried and failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server could not be reached
    #[error("Server down: {0}")]
    ServerDown(String),

    /// A connect or operation timeout elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The server rejected the bind credentials
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The target entry does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An entry with the target DN already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The server truncated the result set by policy
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// The server redirected the operation elsewhere; the payload is the
    /// diagnostic text that embeds the referral URL
    #[error("Referral: {0}")]
    Referral(String),

    /// A referral payload did not contain a usable directory URL
    #[error("Bad referral: {0}")]
    BadReferral(String),

    /// Catch-all protocol error, preserves the underlying message text
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Specialized result type for directory operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the stable variant name for this error.
    ///
    /// Operation failure messages embed this name so operators can tell
    /// causes apart from the message text alone.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "Config",
            Self::Connection(_) => "Connection",
            Self::ServerDown(_) => "ServerDown",
            Self::Timeout(_) => "Timeout",
            Self::InvalidCredentials(_) => "InvalidCredentials",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::LimitExceeded(_) => "LimitExceeded",
            Self::Referral(_) => "Referral",
            Self::BadReferral(_) => "BadReferral",
            Self::Protocol(_) => "Protocol",
        }
    }

    /// Returns true if the error indicates the attempted server is unusable
    /// and the next server in the failover order should be tried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServerDown(_) | Self::Timeout(_) | Self::InvalidCredentials(_)
        )
    }

    /// Returns true if the error means a cached connection should be
    /// discarded and re-established rather than surfaced.
    #[must_use]
    pub const fn is_cache_miss(&self) -> bool {
        matches!(
            self,
            Self::ServerDown(_)
                | Self::Timeout(_)
                | Self::InvalidCredentials(_)
                | Self::NotFound(_)
        )
    }
}

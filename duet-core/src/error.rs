//! Error types shared by every Duet crate.
//!
//! Key bootstrap, HTTP, socket and storage failures are unified into a single
//! `DuetError` enum with conversions from the underlying library errors.

use thiserror::Error;

/// Convenience type alias for Results using DuetError.
pub type DuetResult<T> = Result<T, DuetError>;

/// Unified error type for the Duet client core.
#[derive(Error, Debug)]
pub enum DuetError {
    // -- Configuration errors --
    /// Failed to load or parse application configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required configuration value is missing.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    // -- Network errors (directory / key-exchange calls) --
    /// HTTP request failed at the transport level.
    #[error("http error: {0}")]
    Http(String),

    /// HTTP request timed out.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// Server returned an error response.
    #[error("server error (status {status}): {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Error message from server.
        message: String,
    },

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    // -- Key bootstrap errors --
    /// A bounded poll ran out of attempts before the remote value appeared.
    #[error("partner not ready: {0}")]
    PartnerNotReady(String),

    /// Malformed key material or an encrypt/decrypt failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The exchange store holds a shared key copy this device cannot open,
    /// e.g. after a reinstall lost the identity keypair.
    #[error("pairing reset required: {0}")]
    PairingResetRequired(String),

    /// An encrypted send was requested before a shared key exists.
    #[error("no shared key available")]
    MissingSharedKey,

    // -- Realtime errors --
    /// Socket-level failure: transport closed, handshake refused, heartbeat lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// An operation needed a live connection and there was none.
    #[error("not connected")]
    NotConnected,

    /// An inbound frame or payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    // -- File/IO errors --
    /// File system operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // -- Generic --
    /// An unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Wrapping anyhow errors for interop.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DuetError {
    /// Whether this error came from the directory/key-exchange transport.
    ///
    /// These are the expected, re-invocable failures of a bootstrap run.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Timeout(_) | Self::ServerError { .. } | Self::AuthFailed(_)
        )
    }

    /// Whether re-running the failed operation later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_network() || matches!(self, Self::PartnerNotReady(_) | Self::Connection(_))
    }

    /// Short reason suitable for showing to the end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::PartnerNotReady(what) => format!("partner has not registered {what} yet"),
            Self::Crypto(_) => "stored encryption keys are unreadable; re-pair to continue".into(),
            Self::PairingResetRequired(_) => {
                "this device's encryption keys no longer match your partner's; reset the pairing".into()
            }
            Self::MissingSharedKey => "encryption is not set up for this pairing yet".into(),
            Self::AuthFailed(_) => "your session has expired; sign in again".into(),
            e if e.is_network() => "could not reach the server; try again later".into(),
            Self::NotConnected | Self::Connection(_) => "chat is offline".into(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for DuetError {
    fn from(e: serde_json::Error) -> Self {
        DuetError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for DuetError {
    fn from(e: toml::de::Error) -> Self {
        DuetError::Config(e.to_string())
    }
}

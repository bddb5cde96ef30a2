//! Application-wide constants.

/// Application name, also the data directory name.
pub const APP_NAME: &str = "Duet";

/// Application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log file prefix for the rolling appender.
pub const LOG_FILE_NAME: &str = "duet.log";

/// Default REST API timeout in milliseconds.
pub const DEFAULT_API_TIMEOUT_MS: u64 = 30_000;

/// Maximum number of chat message ids remembered for echo deduplication.
pub const MAX_HANDLED_MESSAGE_HISTORY: usize = 200;

/// STOMP protocol versions offered in the CONNECT frame.
pub const STOMP_ACCEPT_VERSION: &str = "1.2";

/// Reconnect defaults.
pub mod reconnect {
    /// First reconnect delay in milliseconds; doubles per attempt.
    pub const BASE_DELAY_MS: u64 = 1_000;
    /// Attempts before the client gives up and stays disconnected.
    pub const MAX_ATTEMPTS: u32 = 5;
}

/// Heartbeat defaults, in milliseconds.
pub mod heartbeat {
    /// How often the client promises to send a heartbeat.
    pub const OUTGOING_MS: u64 = 10_000;
    /// How often the client asks the broker to send one.
    pub const INCOMING_MS: u64 = 10_000;
    /// Silence longer than `INCOMING_MS * GRACE_FACTOR` is a dead connection.
    pub const GRACE_FACTOR: u32 = 2;
}

/// Key bootstrap defaults.
pub mod e2ee {
    /// RSA modulus size in bits.
    pub const RSA_KEY_BITS: usize = 2048;
    /// AES key length in bytes (AES-256).
    pub const AES_KEY_LEN: usize = 32;
    /// AES-GCM nonce length in bytes.
    pub const GCM_IV_LEN: usize = 12;
    /// Polls for the partner's public key before giving up.
    pub const PARTNER_KEY_POLL_ATTEMPTS: u32 = 10;
    /// Polls for the shared key copy before giving up.
    pub const SHARED_KEY_POLL_ATTEMPTS: u32 = 10;
    /// Delay between polls in milliseconds.
    pub const POLL_INTERVAL_MS: u64 = 3_000;
}

//! Duet E2EE - shared key bootstrap and payload encryption.
//!
//! - `crypto`: RSA identity keys, AES-256-GCM envelopes, fingerprints
//! - `vault`: passphrase sealing of the local key files
//! - `storage`: per-field secret stores and typed key access
//! - `remote`: the key directory / key-exchange seam
//! - `poll`: bounded polling with an injectable sleeper
//! - `bootstrap`: the key exchange state machine

pub mod bootstrap;
pub mod crypto;
pub mod poll;
pub mod remote;
pub mod storage;
pub mod vault;

pub use bootstrap::{BootstrapState, E2eeBootstrap, PairingContext, Role};
pub use crypto::{CryptoManager, EncryptedEnvelope, IdentityKeypair, SharedKey};
pub use poll::{PollPolicy, Sleeper, TokioSleeper};
pub use remote::{KeyService, RemoteKeyService};
pub use storage::{FileSecretStore, KeyField, KeyStorageManager, MemorySecretStore, SecretStore};
pub use vault::Vault;

//! Shared key bootstrap between the two parties of a pairing.
//!
//! ```text
//! NoKeypair -> KeypairReady -> PublicKeyPublished -+-> AwaitingPartnerKey -+-> SharedKeyReady
//!                                                  +-> AwaitingSharedKey --+
//!                      (any error or exhausted poll) -> SetupFailed
//! ```
//!
//! The initiator generates the AES key and uploads it RSA-encrypted for both
//! parties; the responder only downloads and decrypts its copy. Once a shared
//! key is stored locally every entry point returns it untouched until
//! [`E2eeBootstrap::reset_pairing`] is called.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use duet_core::config::E2eeConfig;
use duet_core::constants::e2ee as defaults;
use duet_core::error::{DuetError, DuetResult};

use crate::crypto::{CryptoManager, IdentityKeypair, SharedKey};
use crate::poll::{poll_until, PollPolicy, Sleeper, TokioSleeper};
use crate::remote::KeyService;
use crate::storage::KeyStorageManager;

/// Observable progress of a bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NoKeypair,
    KeypairReady,
    PublicKeyPublished,
    AwaitingPartnerKey,
    AwaitingSharedKey,
    SharedKeyReady,
    SetupFailed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoKeypair => "no_keypair",
            Self::KeypairReady => "keypair_ready",
            Self::PublicKeyPublished => "public_key_published",
            Self::AwaitingPartnerKey => "awaiting_partner_key",
            Self::AwaitingSharedKey => "awaiting_shared_key",
            Self::SharedKeyReady => "shared_key_ready",
            Self::SetupFailed => "setup_failed",
        };
        f.write_str(s)
    }
}

/// Which side of the exchange a party plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Generates and uploads the shared key.
    Initiator,
    /// Waits for its copy and decrypts it.
    Responder,
}

/// Identities of both parties plus the pairing they share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingContext {
    pub self_id: String,
    pub partner_id: String,
    pub pairing_id: String,
}

impl PairingContext {
    pub fn new(
        self_id: impl Into<String>,
        partner_id: impl Into<String>,
        pairing_id: impl Into<String>,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            partner_id: partner_id.into(),
            pairing_id: pairing_id.into(),
        }
    }

    /// The lower identity initiates; both sides compute the same answer.
    pub fn elected_role(&self) -> Role {
        if self.self_id < self.partner_id {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// Drives the key exchange for one party.
///
/// Calls for the same pairing must not overlap; storage writes are per field.
pub struct E2eeBootstrap {
    service: Arc<dyn KeyService>,
    storage: KeyStorageManager,
    sleeper: Arc<dyn Sleeper>,
    partner_poll: PollPolicy,
    shared_poll: PollPolicy,
    rsa_bits: usize,
    state_tx: watch::Sender<BootstrapState>,
}

impl E2eeBootstrap {
    /// Create a bootstrap with default polling and key size.
    pub fn new(service: Arc<dyn KeyService>, storage: KeyStorageManager) -> Self {
        let interval = std::time::Duration::from_millis(defaults::POLL_INTERVAL_MS);
        let initial = initial_state(&storage);
        let (state_tx, _) = watch::channel(initial);
        Self {
            service,
            storage,
            sleeper: Arc::new(TokioSleeper),
            partner_poll: PollPolicy::new(defaults::PARTNER_KEY_POLL_ATTEMPTS, interval),
            shared_poll: PollPolicy::new(defaults::SHARED_KEY_POLL_ATTEMPTS, interval),
            rsa_bits: defaults::RSA_KEY_BITS,
            state_tx,
        }
    }

    /// Create a bootstrap tuned by the `[e2ee]` configuration section.
    pub fn from_config(
        config: &E2eeConfig,
        service: Arc<dyn KeyService>,
        storage: KeyStorageManager,
    ) -> Self {
        let interval = config.poll_interval();
        Self::new(service, storage)
            .with_partner_poll(PollPolicy::new(config.partner_key_poll_attempts, interval))
            .with_shared_poll(PollPolicy::new(config.shared_key_poll_attempts, interval))
            .with_rsa_bits(config.rsa_key_bits)
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_partner_poll(mut self, policy: PollPolicy) -> Self {
        self.partner_poll = policy;
        self
    }

    pub fn with_shared_poll(mut self, policy: PollPolicy) -> Self {
        self.shared_poll = policy;
        self
    }

    pub fn with_rsa_bits(mut self, bits: usize) -> Self {
        self.rsa_bits = bits;
        self
    }

    pub fn state(&self) -> BootstrapState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<BootstrapState> {
        self.state_tx.subscribe()
    }

    pub fn storage(&self) -> &KeyStorageManager {
        &self.storage
    }

    /// The stored shared key, if bootstrap has completed.
    pub fn shared_key(&self) -> DuetResult<Option<SharedKey>> {
        self.storage.shared_key()
    }

    /// Fingerprint of this party's public key, for out-of-band comparison.
    pub fn own_fingerprint(&self) -> DuetResult<Option<String>> {
        self.storage
            .public_key()?
            .map(|key| CryptoManager::fingerprint(&key))
            .transpose()
    }

    /// Fingerprint of the cached partner key.
    pub fn partner_fingerprint(&self) -> DuetResult<Option<String>> {
        self.storage
            .partner_public_key()?
            .map(|key| CryptoManager::fingerprint(&key))
            .transpose()
    }

    /// Generate and persist an identity keypair unless one exists.
    ///
    /// Returns the base64 public key either way.
    pub async fn ensure_keypair(&self) -> DuetResult<String> {
        let result = self.load_or_generate_keypair().await;
        self.track(result).map(|(_, public_key)| public_key)
    }

    /// Upload the local public key to the directory.
    pub async fn publish_public_key(&self) -> DuetResult<()> {
        let result = self.publish_inner().await.map(|_| ());
        self.track(result)
    }

    /// Poll the directory for the partner's public key and cache it.
    pub async fn await_partner_public_key(
        &self,
        pairing_id: &str,
        policy: PollPolicy,
    ) -> DuetResult<String> {
        let result = self.await_partner_inner(pairing_id, policy).await;
        self.track(result)
    }

    /// Generate the shared key and upload a copy for each party.
    pub async fn bootstrap_as_initiator(&self, pairing_id: &str) -> DuetResult<SharedKey> {
        if let Some(key) = self.existing_shared_key()? {
            return Ok(key);
        }
        let result = self.initiate(pairing_id).await;
        self.track(result)
    }

    /// Wait for the initiator's upload and decrypt this party's copy.
    pub async fn bootstrap_as_responder(&self) -> DuetResult<SharedKey> {
        if let Some(key) = self.existing_shared_key()? {
            return Ok(key);
        }
        let result = self.respond().await;
        self.track(result)
    }

    /// Safe to call on every launch.
    ///
    /// A stored key is returned without contacting the service. Otherwise a
    /// copy already uploaded for this party is adopted, and only when the
    /// store holds none does the lower identity initiate. A copy this device
    /// cannot open fails with [`DuetError::PairingResetRequired`] instead of
    /// generating a second key.
    pub async fn bootstrap_idempotent(&self, pairing: &PairingContext) -> DuetResult<SharedKey> {
        if let Some(key) = self.existing_shared_key()? {
            return Ok(key);
        }

        let waiting = self
            .service
            .own_shared_key()
            .await
            .map(|status| status.into_encrypted_key());
        if let Some(encrypted) = self.track(waiting)? {
            info!("adopting uploaded shared key for pairing {}", pairing.pairing_id);
            let result = self.adopt_uploaded_copy(&encrypted);
            return self.track(result);
        }

        let role = pairing.elected_role();
        info!("bootstrapping pairing {} as {:?}", pairing.pairing_id, role);
        match role {
            Role::Initiator => self.bootstrap_as_initiator(&pairing.pairing_id).await,
            Role::Responder => self.bootstrap_as_responder().await,
        }
    }

    /// Forget the shared key and partner key; the identity keypair stays.
    pub fn reset_pairing(&self) -> DuetResult<()> {
        self.storage.clear_pairing()?;
        let next = if self.storage.has_keypair()? {
            BootstrapState::KeypairReady
        } else {
            BootstrapState::NoKeypair
        };
        self.set_state(next);
        Ok(())
    }

    fn existing_shared_key(&self) -> DuetResult<Option<SharedKey>> {
        let key = self.track(self.storage.shared_key())?;
        if key.is_some() {
            debug!("shared key already stored");
            self.set_state(BootstrapState::SharedKeyReady);
        }
        Ok(key)
    }

    async fn initiate(&self, pairing_id: &str) -> DuetResult<SharedKey> {
        let (_, own_public) = self.publish_inner().await?;
        let partner_public = self.await_partner_inner(pairing_id, self.partner_poll).await?;

        let key = CryptoManager::generate_shared_key();
        let for_self = CryptoManager::encrypt_for(&own_public, key.as_bytes())?;
        let for_partner = CryptoManager::encrypt_for(&partner_public, key.as_bytes())?;
        self.service.upload_shared_keys(&for_self, &for_partner).await?;

        self.storage.save_shared_key(&key)?;
        self.set_state(BootstrapState::SharedKeyReady);
        info!("shared key generated and uploaded for pairing {}", pairing_id);
        Ok(key)
    }

    async fn respond(&self) -> DuetResult<SharedKey> {
        let (keypair, _) = self.publish_inner().await?;

        self.set_state(BootstrapState::AwaitingSharedKey);
        let service = self.service.as_ref();
        let encrypted = poll_until(
            self.shared_poll,
            self.sleeper.as_ref(),
            "the shared key",
            move || async move {
                let status = service.own_shared_key().await?;
                Ok::<_, DuetError>(status.into_encrypted_key())
            },
        )
        .await?;

        let key = SharedKey::from_bytes(&keypair.decrypt(&encrypted)?)?;
        self.storage.save_shared_key(&key)?;
        self.set_state(BootstrapState::SharedKeyReady);
        info!("shared key received");
        Ok(key)
    }

    /// Open a copy found in the exchange store with the local keypair.
    fn adopt_uploaded_copy(&self, encrypted: &str) -> DuetResult<SharedKey> {
        let Some(keypair) = self.storage.load_keypair()? else {
            return Err(DuetError::PairingResetRequired(
                "a shared key exists for this pairing but the local keypair is gone".into(),
            ));
        };
        let key = keypair
            .decrypt(encrypted)
            .and_then(|bytes| SharedKey::from_bytes(&bytes))
            .map_err(|e| {
                DuetError::PairingResetRequired(format!("uploaded shared key is unreadable: {e}"))
            })?;
        self.storage.save_shared_key(&key)?;
        self.set_state(BootstrapState::SharedKeyReady);
        Ok(key)
    }

    async fn publish_inner(&self) -> DuetResult<(IdentityKeypair, String)> {
        let (keypair, public_key) = self.load_or_generate_keypair().await?;
        self.service.publish_public_key(&public_key).await?;
        self.set_state(BootstrapState::PublicKeyPublished);
        debug!("public key published");
        Ok((keypair, public_key))
    }

    async fn await_partner_inner(
        &self,
        pairing_id: &str,
        policy: PollPolicy,
    ) -> DuetResult<String> {
        self.set_state(BootstrapState::AwaitingPartnerKey);
        let service = self.service.as_ref();
        let public_key = poll_until(
            policy,
            self.sleeper.as_ref(),
            "a public key",
            move || async move {
                let status = service.partner_public_key(pairing_id).await?;
                Ok::<_, DuetError>(status.into_key())
            },
        )
        .await?;

        CryptoManager::parse_public_key(&public_key)?;
        self.storage.save_partner_public_key(&public_key)?;
        debug!("partner public key cached");
        Ok(public_key)
    }

    async fn load_or_generate_keypair(&self) -> DuetResult<(IdentityKeypair, String)> {
        let keypair = match self.storage.load_keypair()? {
            Some(existing) => existing,
            None => {
                let bits = self.rsa_bits;
                info!("generating {}-bit identity keypair", bits);
                let generated =
                    tokio::task::spawn_blocking(move || CryptoManager::generate_keypair(bits))
                        .await
                        .map_err(|e| {
                            DuetError::Internal(format!("key generation task failed: {e}"))
                        })??;
                self.storage.save_keypair(&generated)?;
                generated
            }
        };
        let public_key = keypair.public_key_b64()?;
        if matches!(self.state(), BootstrapState::NoKeypair | BootstrapState::SetupFailed) {
            self.set_state(BootstrapState::KeypairReady);
        }
        Ok((keypair, public_key))
    }

    fn set_state(&self, state: BootstrapState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("bootstrap state: {} -> {}", current, state);
            *current = state;
            true
        });
    }

    /// Mark the run failed when `result` is an error.
    fn track<T>(&self, result: DuetResult<T>) -> DuetResult<T> {
        if let Err(e) = &result {
            warn!("key bootstrap failed: {}", e);
            self.set_state(BootstrapState::SetupFailed);
        }
        result
    }
}

fn initial_state(storage: &KeyStorageManager) -> BootstrapState {
    let read = || -> DuetResult<BootstrapState> {
        Ok(if storage.has_shared_key()? {
            BootstrapState::SharedKeyReady
        } else if storage.has_keypair()? {
            BootstrapState::KeypairReady
        } else {
            BootstrapState::NoKeypair
        })
    };
    read().unwrap_or_else(|e| {
        warn!("could not read key store: {}", e);
        BootstrapState::NoKeypair
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_election_is_symmetric() {
        let alice = PairingContext::new("user-a", "user-b", "p1");
        let bob = PairingContext::new("user-b", "user-a", "p1");
        assert_eq!(alice.elected_role(), Role::Initiator);
        assert_eq!(bob.elected_role(), Role::Responder);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BootstrapState::AwaitingPartnerKey.to_string(), "awaiting_partner_key");
        assert_eq!(BootstrapState::SetupFailed.to_string(), "setup_failed");
    }

    #[test]
    fn test_initial_state_reflects_storage() {
        let storage = KeyStorageManager::in_memory();
        assert_eq!(initial_state(&storage), BootstrapState::NoKeypair);

        storage
            .save_keypair(&CryptoManager::generate_keypair(1024).unwrap())
            .unwrap();
        assert_eq!(initial_state(&storage), BootstrapState::KeypairReady);

        storage
            .save_shared_key(&CryptoManager::generate_shared_key())
            .unwrap();
        assert_eq!(initial_state(&storage), BootstrapState::SharedKeyReady);
    }
}

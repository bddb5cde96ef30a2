//! Local key storage.
//!
//! Secrets are stored one field at a time. There is no transaction across
//! fields: a crash between two writes can leave, say, a private key without
//! its public half, which `KeyStorageManager::load_keypair` tolerates by
//! re-deriving the public key from the private one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use duet_core::config::AppConfig;
use duet_core::error::{DuetError, DuetResult};

use crate::crypto::{IdentityKeypair, SharedKey};
use crate::vault::Vault;

/// The closed set of values kept in the key store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyField {
    PrivateKey,
    PublicKey,
    PartnerPublicKey,
    SharedKey,
}

impl KeyField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrivateKey => "private_key",
            Self::PublicKey => "public_key",
            Self::PartnerPublicKey => "partner_public_key",
            Self::SharedKey => "shared_key",
        }
    }
}

/// Per-field secret persistence.
pub trait SecretStore: Send + Sync {
    fn get(&self, field: KeyField) -> DuetResult<Option<String>>;
    fn put(&self, field: KeyField, value: &str) -> DuetResult<()>;
    fn remove(&self, field: KeyField) -> DuetResult<()>;
}

/// Sealed files, one per field, in a private directory.
pub struct FileSecretStore {
    dir: PathBuf,
    vault: Vault,
}

impl FileSecretStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: &Path, passphrase: &str) -> DuetResult<Self> {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
        debug!("key store opened at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            vault: Vault::new(passphrase)?,
        })
    }

    fn path(&self, field: KeyField) -> PathBuf {
        self.dir.join(format!("{}.sealed", field.as_str()))
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, field: KeyField) -> DuetResult<Option<String>> {
        let path = self.path(field);
        let sealed = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bytes = self.vault.open(&sealed)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| DuetError::Crypto(format!("{} is not utf8: {e}", field.as_str())))
    }

    fn put(&self, field: KeyField, value: &str) -> DuetResult<()> {
        let sealed = self.vault.seal(value.as_bytes())?;
        let path = self.path(field);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, sealed)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, field: KeyField) -> DuetResult<()> {
        match std::fs::remove_file(self.path(field)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemorySecretStore {
    fields: Mutex<HashMap<KeyField, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DuetResult<std::sync::MutexGuard<'_, HashMap<KeyField, String>>> {
        self.fields
            .lock()
            .map_err(|_| DuetError::Internal("memory key store lock poisoned".into()))
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, field: KeyField) -> DuetResult<Option<String>> {
        Ok(self.lock()?.get(&field).cloned())
    }

    fn put(&self, field: KeyField, value: &str) -> DuetResult<()> {
        self.lock()?.insert(field, value.to_string());
        Ok(())
    }

    fn remove(&self, field: KeyField) -> DuetResult<()> {
        self.lock()?.remove(&field);
        Ok(())
    }
}

/// Typed access to the key store.
#[derive(Clone)]
pub struct KeyStorageManager {
    store: Arc<dyn SecretStore>,
}

impl KeyStorageManager {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Convenience constructor over a fresh [`MemorySecretStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySecretStore::new()))
    }

    /// File-backed storage in the configured key directory.
    pub fn open(config: &AppConfig, passphrase: &str) -> DuetResult<Self> {
        let dir = config.effective_key_store_dir()?;
        Ok(Self::new(Arc::new(FileSecretStore::open(&dir, passphrase)?)))
    }

    pub fn has_keypair(&self) -> DuetResult<bool> {
        Ok(self.store.get(KeyField::PrivateKey)?.is_some())
    }

    /// Load the identity keypair, if one was generated.
    pub fn load_keypair(&self) -> DuetResult<Option<IdentityKeypair>> {
        let Some(private) = self.store.get(KeyField::PrivateKey)? else {
            return Ok(None);
        };
        let keypair = IdentityKeypair::from_private_key_b64(&private)?;
        if self.store.get(KeyField::PublicKey)?.is_none() {
            warn!("public key field missing; restoring it from the private key");
            self.store.put(KeyField::PublicKey, &keypair.public_key_b64()?)?;
        }
        Ok(Some(keypair))
    }

    /// Persist a keypair. The private key is written first so a torn write
    /// never leaves a public key without its private half.
    pub fn save_keypair(&self, keypair: &IdentityKeypair) -> DuetResult<()> {
        self.store.put(KeyField::PrivateKey, &keypair.private_key_b64()?)?;
        self.store.put(KeyField::PublicKey, &keypair.public_key_b64()?)?;
        info!("identity keypair stored");
        Ok(())
    }

    pub fn public_key(&self) -> DuetResult<Option<String>> {
        self.store.get(KeyField::PublicKey)
    }

    pub fn partner_public_key(&self) -> DuetResult<Option<String>> {
        self.store.get(KeyField::PartnerPublicKey)
    }

    pub fn save_partner_public_key(&self, public_key: &str) -> DuetResult<()> {
        self.store.put(KeyField::PartnerPublicKey, public_key)
    }

    pub fn shared_key(&self) -> DuetResult<Option<SharedKey>> {
        self.store
            .get(KeyField::SharedKey)?
            .map(|encoded| SharedKey::from_b64(&encoded))
            .transpose()
    }

    pub fn has_shared_key(&self) -> DuetResult<bool> {
        Ok(self.store.get(KeyField::SharedKey)?.is_some())
    }

    pub fn save_shared_key(&self, key: &SharedKey) -> DuetResult<()> {
        self.store.put(KeyField::SharedKey, &key.to_b64())?;
        info!("shared key stored");
        Ok(())
    }

    /// Forget everything tied to the current pairing; keep the identity.
    pub fn clear_pairing(&self) -> DuetResult<()> {
        self.store.remove(KeyField::SharedKey)?;
        self.store.remove(KeyField::PartnerPublicKey)?;
        info!("pairing keys cleared");
        Ok(())
    }
}

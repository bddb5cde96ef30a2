//! Cryptographic primitives for the key bootstrap and chat payloads.
//!
//! - Identity keys: RSA (2048-bit by default) with OAEP/SHA-256 padding.
//!   Public keys travel as base64 SPKI DER, private keys are stored as
//!   base64 PKCS#8 DER.
//! - Shared key: 32 random bytes used with AES-256-GCM. Every encryption
//!   draws a fresh 96-bit IV, carried next to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use duet_core::constants::e2ee::{AES_KEY_LEN, GCM_IV_LEN};
use duet_core::error::{DuetError, DuetResult};

/// A party's RSA identity keypair.
#[derive(Clone)]
pub struct IdentityKeypair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl IdentityKeypair {
    /// Restore a keypair from its base64 PKCS#8 private key.
    pub fn from_private_key_b64(encoded: &str) -> DuetResult<Self> {
        let der = decode_b64(encoded, "private key")?;
        let private_key = RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| DuetError::Crypto(format!("invalid private key: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Base64 SPKI DER encoding of the public half.
    pub fn public_key_b64(&self) -> DuetResult<String> {
        let der = self
            .public_key
            .to_public_key_der()
            .map_err(|e| DuetError::Crypto(format!("public key encoding failed: {e}")))?;
        Ok(B64.encode(der.as_bytes()))
    }

    /// Base64 PKCS#8 DER encoding of the private half.
    pub fn private_key_b64(&self) -> DuetResult<String> {
        let der = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| DuetError::Crypto(format!("private key encoding failed: {e}")))?;
        Ok(B64.encode(der.as_bytes()))
    }

    /// Decrypt a base64 OAEP ciphertext addressed to this keypair.
    pub fn decrypt(&self, ciphertext_b64: &str) -> DuetResult<Vec<u8>> {
        let ciphertext = decode_b64(ciphertext_b64, "rsa ciphertext")?;
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|e| DuetError::Crypto(format!("rsa decryption failed: {e}")))
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeypair").finish_non_exhaustive()
    }
}

/// The AES-256 key shared by both parties of a pairing.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; AES_KEY_LEN]);

impl SharedKey {
    /// Wrap raw key bytes; anything but 32 bytes is corrupted key material.
    pub fn from_bytes(bytes: &[u8]) -> DuetResult<Self> {
        let key: [u8; AES_KEY_LEN] = bytes.try_into().map_err(|_| {
            DuetError::Crypto(format!(
                "shared key must be {AES_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn from_b64(encoded: &str) -> DuetResult<Self> {
        Self::from_bytes(&decode_b64(encoded, "shared key")?)
    }

    pub fn to_b64(&self) -> String {
        B64.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Ciphertext plus the IV it was produced with, both base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub encrypted_content: String,
    pub iv: String,
}

/// Stateless entry points for every cryptographic operation.
pub struct CryptoManager;

impl CryptoManager {
    /// Generate a fresh RSA identity keypair.
    ///
    /// This is CPU-heavy; async callers should run it on a blocking thread.
    pub fn generate_keypair(bits: usize) -> DuetResult<IdentityKeypair> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| DuetError::Crypto(format!("rsa key generation failed: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(IdentityKeypair {
            private_key,
            public_key,
        })
    }

    /// Encrypt `data` for the holder of a base64 SPKI public key.
    pub fn encrypt_for(public_key_b64: &str, data: &[u8]) -> DuetResult<String> {
        let public_key = Self::parse_public_key(public_key_b64)?;
        let mut rng = rand::thread_rng();
        let ciphertext = public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), data)
            .map_err(|e| DuetError::Crypto(format!("rsa encryption failed: {e}")))?;
        Ok(B64.encode(ciphertext))
    }

    /// Validate a base64 SPKI public key.
    pub fn parse_public_key(public_key_b64: &str) -> DuetResult<RsaPublicKey> {
        let der = decode_b64(public_key_b64, "public key")?;
        RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| DuetError::Crypto(format!("invalid public key: {e}")))
    }

    /// Generate a new random AES-256 shared key.
    pub fn generate_shared_key() -> SharedKey {
        let mut key = [0u8; AES_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        SharedKey(key)
    }

    /// Encrypt a UTF-8 message under the shared key with a fresh IV.
    pub fn encrypt_message(key: &SharedKey, plaintext: &str) -> DuetResult<EncryptedEnvelope> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| DuetError::Crypto(format!("cipher init failed: {e}")))?;

        let mut iv = [0u8; GCM_IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| DuetError::Crypto(format!("encryption failed: {e}")))?;

        Ok(EncryptedEnvelope {
            encrypted_content: B64.encode(ciphertext),
            iv: B64.encode(iv),
        })
    }

    /// Decrypt an envelope produced by [`CryptoManager::encrypt_message`].
    pub fn decrypt_message(key: &SharedKey, envelope: &EncryptedEnvelope) -> DuetResult<String> {
        let iv = decode_b64(&envelope.iv, "iv")?;
        if iv.len() != GCM_IV_LEN {
            return Err(DuetError::Crypto(format!(
                "iv must be {GCM_IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        let ciphertext = decode_b64(&envelope.encrypted_content, "ciphertext")?;

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| DuetError::Crypto(format!("cipher init failed: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
            .map_err(|e| DuetError::Crypto(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| DuetError::Crypto(format!("utf8 decode failed: {e}")))
    }

    /// SHA-256 fingerprint of a public key, as colon-separated hex pairs.
    ///
    /// Both parties can compare these out of band to rule out a swapped key.
    pub fn fingerprint(public_key_b64: &str) -> DuetResult<String> {
        let der = decode_b64(public_key_b64, "public key")?;
        let digest = Sha256::digest(&der);
        Ok(digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":"))
    }
}

fn decode_b64(encoded: &str, what: &str) -> DuetResult<Vec<u8>> {
    B64.decode(encoded.trim())
        .map_err(|e| DuetError::Crypto(format!("{what} is not valid base64: {e}")))
}

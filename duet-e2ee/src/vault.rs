//! At-rest sealing for the local key files.
//!
//! Each value is sealed with AES-256-CBC in the OpenSSL "Salted__" layout:
//! key and IV come from EVP_BytesToKey (MD5) over the device passphrase and
//! a random 8-byte salt, so sealing the same value twice never produces the
//! same file contents.
//!
//! ```text
//! base64( "Salted__" | salt[8] | ciphertext )
//! ```

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use md5::{Digest, Md5};
use rand::RngCore;

use duet_core::error::{DuetError, DuetResult};

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

const MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN;

/// Passphrase-keyed sealing of small secrets.
#[derive(Clone)]
pub struct Vault {
    passphrase: Vec<u8>,
}

impl Vault {
    pub fn new(passphrase: impl Into<Vec<u8>>) -> DuetResult<Self> {
        let passphrase = passphrase.into();
        if passphrase.is_empty() {
            return Err(DuetError::Config("vault passphrase must not be empty".into()));
        }
        Ok(Self { passphrase })
    }

    /// Seal `plaintext`, returning the base64 salted blob.
    pub fn seal(&self, plaintext: &[u8]) -> DuetResult<String> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let (key, iv) = derive_key_iv(&self.passphrase, &salt);
        let encryptor = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|e| DuetError::Crypto(format!("cipher init failed: {e}")))?;
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut output = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        output.extend_from_slice(MAGIC);
        output.extend_from_slice(&salt);
        output.extend_from_slice(&ciphertext);

        Ok(B64.encode(output))
    }

    /// Open a blob produced by [`Vault::seal`].
    pub fn open(&self, sealed: &str) -> DuetResult<Vec<u8>> {
        let raw = B64
            .decode(sealed.trim())
            .map_err(|e| DuetError::Crypto(format!("sealed value is not base64: {e}")))?;

        if raw.len() <= HEADER_LEN {
            return Err(DuetError::Crypto("sealed value too short".into()));
        }
        if &raw[..MAGIC.len()] != MAGIC {
            return Err(DuetError::Crypto("missing Salted__ prefix".into()));
        }

        let (key, iv) = derive_key_iv(&self.passphrase, &raw[MAGIC.len()..HEADER_LEN]);
        let decryptor = Aes256CbcDec::new_from_slices(&key, &iv)
            .map_err(|e| DuetError::Crypto(format!("cipher init failed: {e}")))?;

        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&raw[HEADER_LEN..])
            .map_err(|e| DuetError::Crypto(format!("unseal failed: {e}")))
    }
}

/// OpenSSL EVP_BytesToKey with MD5: 32-byte key followed by a 16-byte IV.
fn derive_key_iv(passphrase: &[u8], salt: &[u8]) -> ([u8; 32], [u8; 16]) {
    let mut derived = Vec::with_capacity(48);
    let mut block: Vec<u8> = Vec::new();

    while derived.len() < 48 {
        let mut hasher = Md5::new();
        hasher.update(&block);
        hasher.update(passphrase);
        hasher.update(salt);
        block = hasher.finalize().to_vec();
        derived.extend_from_slice(&block);
    }

    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&derived[..32]);
    iv.copy_from_slice(&derived[32..48]);
    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let vault = Vault::new("device-secret").unwrap();
        let sealed = vault.seal(b"MIIEvQIBADANBgkqhkiG9w0BAQEFAASC").unwrap();
        assert_eq!(vault.open(&sealed).unwrap(), b"MIIEvQIBADANBgkqhkiG9w0BAQEFAASC");
    }

    #[test]
    fn test_salt_makes_output_unique() {
        let vault = Vault::new("device-secret").unwrap();
        assert_ne!(vault.seal(b"same").unwrap(), vault.seal(b"same").unwrap());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealed = Vault::new("right").unwrap().seal(&[42u8; 64]).unwrap();
        let result = Vault::new("wrong").unwrap().open(&sealed);
        // PKCS7 padding check catches nearly every wrong key; if it happens to
        // pass, the bytes still differ.
        match result {
            Err(DuetError::Crypto(_)) => {}
            Ok(bytes) => assert_ne!(bytes, vec![42u8; 64]),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rejects_truncated_and_unprefixed() {
        let vault = Vault::new("p").unwrap();
        assert!(vault.open(&B64.encode(b"short")).is_err());
        assert!(vault.open(&B64.encode([0u8; 40])).is_err());
        assert!(vault.open("%%%").is_err());
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(Vault::new("").is_err());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let (k1, iv1) = derive_key_iv(b"password", b"saltsalt");
        let (k2, iv2) = derive_key_iv(b"password", b"saltsalt");
        assert_eq!(k1, k2);
        assert_eq!(iv1, iv2);
    }
}

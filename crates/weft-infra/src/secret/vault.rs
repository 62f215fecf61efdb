//! AES-256-GCM vault decrypter for tool credentials.
//!
//! Ciphertext format: `nonce (12 bytes) || ciphertext`. Each encryption call
//! generates a random nonce, so encrypting the same plaintext twice produces
//! different output.
//!
//! SECURITY: errors never contain plaintext or key material.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use secrecy::SecretString;

use weft_core::secret::{SecretDecrypter, SecretError};

/// Nonce size for AES-256-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Symmetric credential decrypter over a raw 32-byte master key.
///
/// Key provisioning and rotation happen outside the engine boundary; this
/// type only holds the cipher.
pub struct VaultDecrypter {
    cipher: Aes256Gcm,
}

impl VaultDecrypter {
    /// Create a decrypter from a raw 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Encrypt a plaintext into the vault format. Used when provisioning
    /// credentials onto action nodes (and by tests).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecretError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SecretError::DecryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

impl SecretDecrypter for VaultDecrypter {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<SecretString, SecretError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(SecretError::CiphertextTooShort);
        }
        let (nonce_bytes, payload) = ciphertext.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, payload)
            .map_err(|_| SecretError::DecryptionFailed)?;

        String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|_| SecretError::InvalidPlaintext)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn decrypter() -> VaultDecrypter {
        VaultDecrypter::new(&[7u8; 32])
    }

    #[test]
    fn roundtrip() {
        let vault = decrypter();
        let ciphertext = vault.encrypt(b"api-token-123").unwrap();
        let plaintext = vault.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext.expose_secret(), "api-token-123");
    }

    #[test]
    fn nonce_makes_ciphertexts_differ() {
        let vault = decrypter();
        let first = vault.encrypt(b"same").unwrap();
        let second = vault.encrypt(b"same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let vault = decrypter();
        let mut ciphertext = vault.encrypt(b"secret").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(matches!(
            vault.decrypt(&ciphertext),
            Err(SecretError::DecryptionFailed)
        ));
    }

    #[test]
    fn wrong_key_rejected() {
        let vault = decrypter();
        let ciphertext = vault.encrypt(b"secret").unwrap();
        let other = VaultDecrypter::new(&[8u8; 32]);
        assert!(other.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn short_ciphertext_rejected() {
        let vault = decrypter();
        assert!(matches!(
            vault.decrypt(&[1, 2, 3]),
            Err(SecretError::CiphertextTooShort)
        ));
    }
}

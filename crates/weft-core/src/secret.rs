//! Secret decryption port.
//!
//! The engine only ever needs one secret operation: turning an encrypted
//! tool credential into a plaintext it can hand to the provider. Key
//! management, rotation, and storage of ciphertexts are outside the boundary.

use secrecy::SecretString;
use thiserror::Error;

/// Errors from secret decryption.
///
/// Never includes plaintext, key material, or ciphertext in Display/Debug
/// output.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("ciphertext is not valid utf-8 after decryption")]
    InvalidPlaintext,
}

/// Trait for decrypting tool credentials. Implementations live in weft-infra.
pub trait SecretDecrypter: Send + Sync {
    /// Decrypt a ciphertext into a wrapped plaintext string.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<SecretString, SecretError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_no_material() {
        let err = SecretError::DecryptionFailed;
        assert_eq!(err.to_string(), "decryption failed");
    }
}

use crypto_secretbox::XSalsa20Poly1305;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Secret key size negotiated in the session description.
pub const KEY_SIZE: usize = 32;
/// XSalsa20 extended nonce size.
pub const NONCE_SIZE: usize = 24;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key or nonce size for XSalsa20-Poly1305")]
    InvalidSize,
    #[error("XSalsa20-Poly1305 cipher operation failed")]
    CipherError,
}

type Result<T> = std::result::Result<T, CryptoError>;

/// Encryption modes this client can speak, identified on the wire by a fixed string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionMode {
    #[serde(rename = "xsalsa20_poly1305")]
    XSalsa20Poly1305,
}

impl EncryptionMode {
    /// Modes in order of preference.
    pub const SUPPORTED: &'static [EncryptionMode] = &[EncryptionMode::XSalsa20Poly1305];

    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::XSalsa20Poly1305 => "xsalsa20_poly1305",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        Self::SUPPORTED
            .iter()
            .copied()
            .find(|mode| mode.as_str() == value)
    }

    /// Picks the most preferred supported mode the server offered.
    pub fn negotiate<S: AsRef<str>>(offered: &[S]) -> Option<Self> {
        Self::SUPPORTED
            .iter()
            .copied()
            .find(|mode| offered.iter().any(|o| o.as_ref() == mode.as_str()))
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prepares an XSalsa20-Poly1305 cipher instance from a secret key.
pub fn prepare(secret_key: &[u8]) -> Result<XSalsa20Poly1305> {
    XSalsa20Poly1305::new_from_slice(secret_key).map_err(|_| CryptoError::InvalidSize)
}

/// Encrypts plaintext using XSalsa20-Poly1305. The returned buffer carries the
/// 16-byte authenticator followed by the ciphertext.
pub fn encrypt(secret_key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidSize);
    }
    let cipher = prepare(secret_key)?;
    cipher
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::CipherError)
}

/// Decrypts ciphertext using XSalsa20-Poly1305.
pub fn decrypt(secret_key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidSize);
    }
    let cipher = prepare(secret_key)?;
    cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::CipherError)
}

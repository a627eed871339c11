pub mod secretbox;

pub use secretbox::{CryptoError, EncryptionMode, KEY_SIZE, NONCE_SIZE};

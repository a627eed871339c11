pub use crypto_secretbox;
pub mod crypto;
pub mod net;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod state;
pub mod types;

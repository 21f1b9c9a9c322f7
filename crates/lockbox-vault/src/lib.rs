//! lockbox-vault: sealing file keys under two independent secrets
//!
//! The sealed key travels as a trailer appended to the encrypted file, so an
//! encrypted file is a single self-contained artifact.

pub mod keyvault;
pub mod system_key;
pub mod trailer;

pub use keyvault::KeyVault;
pub use system_key::SystemKeyStore;
pub use trailer::{append_trailer, read_trailer, Trailer, LENGTH_FIELD_SIZE};

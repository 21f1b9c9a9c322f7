//! lockbox-crypto: pure crypto primitives for the lockbox file vault
//!
//! Nothing in this crate touches the filesystem.
//!
//! Key hierarchy:
//! ```text
//! File Key (per-file, 256-bit random)
//!   └── Block AEAD: AES-256-GCM (key=file_key, nonce=HKDF(base_nonce, block_index))
//! Master Key (256-bit, caller supplied)  ─┐
//! System Key (256-bit, install-local)    ─┴── wrap the file key + digest (see lockbox-vault)
//! ```

pub mod envelope;
pub mod gate;
pub mod keys;
pub mod nonce;

pub use envelope::{open, seal};
pub use gate::IntegrityGate;
pub use keys::{generate_file_key, generate_master_key, FileKey, MasterKey, SystemKey};
pub use nonce::derive_block_nonce;

use rand::RngCore;
use sha2::{Digest as _, Sha256};

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of an AES-GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a SHA-256 digest
pub const DIGEST_SIZE: usize = 32;

/// Fill a fresh base nonce from the OS RNG.
pub fn generate_base_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// One-shot SHA-256.
pub fn sha256(data: &[u8]) -> lockbox_core::Digest {
    Sha256::digest(data).into()
}

/// Constant-time equality for digests and hashes.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

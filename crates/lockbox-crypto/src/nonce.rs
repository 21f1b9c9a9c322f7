//! Per-block nonce derivation
//!
//! Only the file-level base nonce is stored; the nonce for block `i` is an
//! HKDF-SHA256 output keyed by the base nonce and bound to `i`:
//!
//! ```text
//! salt = base_nonce(12) ‖ pad(20)          pad[i] = 0xAA ^ i, i in 12..32
//! prk  = HMAC-SHA256(key = salt, msg = i as u64 LE)
//! okm  = HKDF-Expand(prk, info = i as u64 LE ‖ "AES-GCM-NONCE-V1", 12)
//! ```

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use lockbox_core::{VaultError, VaultResult};

use crate::NONCE_SIZE;

type HmacSha256 = Hmac<Sha256>;

const SALT_SIZE: usize = 32;
const PRK_SIZE: usize = 32;
const CONTEXT: &[u8; 16] = b"AES-GCM-NONCE-V1";
const INFO_SIZE: usize = 8 + CONTEXT.len();

/// Derive the nonce for `block_index` under `base_nonce`.
pub fn derive_block_nonce(
    base_nonce: &[u8; NONCE_SIZE],
    block_index: u64,
) -> VaultResult<[u8; NONCE_SIZE]> {
    let index_bytes = Zeroizing::new(block_index.to_le_bytes());

    let mut salt = Zeroizing::new([0u8; SALT_SIZE]);
    salt[..NONCE_SIZE].copy_from_slice(base_nonce);
    for (i, b) in salt.iter_mut().enumerate().skip(NONCE_SIZE) {
        *b = 0xAA ^ (i as u8);
    }

    // Extract
    let mut mac = <HmacSha256 as Mac>::new_from_slice(salt.as_ref())
        .map_err(|e| VaultError::Crypto(format!("nonce extract: {e}")))?;
    mac.update(index_bytes.as_ref());
    let mut prk = Zeroizing::new([0u8; PRK_SIZE]);
    prk.copy_from_slice(&mac.finalize().into_bytes());

    // Expand
    let mut info = Zeroizing::new([0u8; INFO_SIZE]);
    info[..8].copy_from_slice(index_bytes.as_ref());
    info[8..].copy_from_slice(CONTEXT);

    let hkdf = Hkdf::<Sha256>::from_prk(prk.as_ref())
        .map_err(|e| VaultError::Crypto(format!("nonce expand: {e}")))?;
    let mut okm = [0u8; NONCE_SIZE];
    hkdf.expand(info.as_ref(), &mut okm)
        .map_err(|e| VaultError::Crypto(format!("nonce expand: {e}")))?;

    Ok(okm)
}

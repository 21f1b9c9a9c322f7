//! Text-encoded AES-256-GCM envelopes used by the key vault
//!
//! Envelope format: `base64([12-byte random nonce][ciphertext][16-byte tag])`

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use lockbox_core::{VaultError, VaultResult};

use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Seal `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> VaultResult<String> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| VaultError::Crypto(format!("envelope seal failed: {e}")))?;

    let mut raw = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    raw.extend_from_slice(&nonce_bytes);
    raw.extend_from_slice(&ciphertext);
    let encoded = STANDARD.encode(&raw);
    raw.zeroize();
    Ok(encoded)
}

/// Open an envelope produced by [`seal`].
///
/// Structural problems (bad base64, too short) are `Integrity` errors; a tag
/// mismatch is an `Authentication` error.
pub fn open(key: &[u8; KEY_SIZE], envelope: &str) -> VaultResult<Zeroizing<Vec<u8>>> {
    let raw = Zeroizing::new(
        STANDARD
            .decode(envelope)
            .map_err(|_| VaultError::Integrity("envelope is not valid base64".into()))?,
    );

    if raw.len() < NONCE_SIZE + TAG_SIZE {
        return Err(VaultError::Integrity(format!(
            "envelope too short: {} bytes (minimum {})",
            raw.len(),
            NONCE_SIZE + TAG_SIZE
        )));
    }

    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(key.into());

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::Authentication("envelope did not authenticate".into()))
}

/// Raw bytes behind an envelope's text form.
pub fn decoded_bytes(envelope: &str) -> VaultResult<Vec<u8>> {
    STANDARD
        .decode(envelope)
        .map_err(|_| VaultError::Integrity("envelope is not valid base64".into()))
}

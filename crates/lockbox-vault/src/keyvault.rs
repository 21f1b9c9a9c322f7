//! Three-layer sealing of a file key and content digest
//!
//! ```text
//! layer 1: A  = seal(master, file_key ‖ digest)
//! layer 2: B  = seal(system, A)            binding = SHA-256(raw B)
//! layer 3: T  = seal(master, B ‖ binding)  -> appended as the trailer
//! ```
//!
//! Unsealing reverses the layers and fails closed at the first AEAD or
//! binding-hash mismatch. Every failure is reported as a key-retrieval error.

use std::path::Path;

use tracing::debug;
use zeroize::Zeroizing;

use lockbox_core::config::KeyVaultConfig;
use lockbox_core::{Digest, SealedKey, VaultError, VaultResult};
use lockbox_crypto::envelope::decoded_bytes;
use lockbox_crypto::{ct_eq, open, seal, sha256, FileKey, MasterKey, DIGEST_SIZE, KEY_SIZE};
use lockbox_storage::DurableOptions;

use crate::system_key::SystemKeyStore;
use crate::trailer::{append_trailer, read_trailer, Trailer};

#[derive(Debug)]
pub struct KeyVault {
    system: SystemKeyStore,
    durable: DurableOptions,
}

/// Attribute an envelope failure to a key-retrieval layer.
fn layer_err(layer: &str) -> impl Fn(VaultError) -> VaultError + '_ {
    move |e| match e {
        VaultError::Authentication(_) => VaultError::key_auth(layer),
        VaultError::Integrity(msg) => VaultError::key_integrity(&format!("{layer}: {msg}")),
        other => other,
    }
}

fn envelope_text<'a>(bytes: &'a [u8], layer: &str) -> VaultResult<&'a str> {
    std::str::from_utf8(bytes)
        .map_err(|_| VaultError::key_integrity(&format!("{layer}: payload is not envelope text")))
}

impl KeyVault {
    pub fn new(system: SystemKeyStore, durable: DurableOptions) -> Self {
        Self { system, durable }
    }

    pub fn from_config(config: &KeyVaultConfig, durable: DurableOptions) -> Self {
        Self::new(SystemKeyStore::from_config(config, durable.clone()), durable)
    }

    pub fn system_keys(&self) -> &SystemKeyStore {
        &self.system
    }

    /// Load (or create) the system key ahead of the first operation.
    pub fn warm_up(&self) -> VaultResult<()> {
        self.system.key().map(|_| ())
    }

    /// Seal `file_key` and `digest` and append the trailer to `dest`.
    pub fn seal(
        &self,
        file_id: &str,
        file_key: &FileKey,
        master: &MasterKey,
        digest: &Digest,
        dest: &Path,
    ) -> VaultResult<SealedKey> {
        let system = self.system.key()?;

        let mut inner = Zeroizing::new(Vec::with_capacity(KEY_SIZE + DIGEST_SIZE));
        inner.extend_from_slice(file_key.as_bytes());
        inner.extend_from_slice(digest);
        let envelope_a = Zeroizing::new(seal(master.as_bytes(), &inner)?);

        let envelope_b = seal(system.as_bytes(), envelope_a.as_bytes())?;
        let key_hash = sha256(&decoded_bytes(&envelope_b)?);
        let sealed = SealedKey {
            file_id: file_id.to_string(),
            encrypted_private_key: envelope_b,
            key_hash,
        };

        let mut outer = Zeroizing::new(Vec::with_capacity(
            sealed.encrypted_private_key.len() + DIGEST_SIZE,
        ));
        outer.extend_from_slice(sealed.encrypted_private_key.as_bytes());
        outer.extend_from_slice(&sealed.key_hash);
        let blob = seal(master.as_bytes(), &outer)?;

        let trailer_len = append_trailer(dest, &blob, self.durable.clone())?;
        debug!(file_id, trailer_len, "file key sealed");
        Ok(sealed)
    }

    /// Read the trailer of `source` and recover the file key and digest.
    pub fn unseal(
        &self,
        file_id: &str,
        master: &MasterKey,
        source: &Path,
    ) -> VaultResult<(FileKey, Digest)> {
        let trailer = read_trailer(source, self.durable.clone())?;
        self.open_trailer(file_id, master, &trailer)
    }

    /// Reverse the three layers of an already-read trailer.
    pub fn open_trailer(
        &self,
        file_id: &str,
        master: &MasterKey,
        trailer: &Trailer,
    ) -> VaultResult<(FileKey, Digest)> {
        let sealed = self.open_outer(file_id, master, trailer)?;
        verify_binding(&sealed)?;

        let system = self.system.key()?;
        let envelope_a = open(system.as_bytes(), &sealed.encrypted_private_key)
            .map_err(layer_err("layer 2"))?;
        let envelope_a = envelope_text(&envelope_a, "layer 2")?;

        let inner = open(master.as_bytes(), envelope_a).map_err(layer_err("layer 1"))?;
        if inner.len() != KEY_SIZE + DIGEST_SIZE {
            return Err(VaultError::key_integrity(&format!(
                "layer 1: expected {} bytes, got {}",
                KEY_SIZE + DIGEST_SIZE,
                inner.len()
            )));
        }

        let key = FileKey::from_slice(&inner[..KEY_SIZE])
            .ok_or_else(|| VaultError::key_integrity("layer 1: malformed file key"))?;
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&inner[KEY_SIZE..]);

        debug!(file_id, "file key unsealed");
        Ok((key, digest))
    }

    fn open_outer(
        &self,
        file_id: &str,
        master: &MasterKey,
        trailer: &Trailer,
    ) -> VaultResult<SealedKey> {
        let outer = open(master.as_bytes(), &trailer.blob).map_err(layer_err("layer 3"))?;
        if outer.len() <= DIGEST_SIZE {
            return Err(VaultError::key_integrity("layer 3: payload too short"));
        }

        let (envelope_b, hash) = outer.split_at(outer.len() - DIGEST_SIZE);
        let mut key_hash = [0u8; DIGEST_SIZE];
        key_hash.copy_from_slice(hash);

        Ok(SealedKey {
            file_id: file_id.to_string(),
            encrypted_private_key: envelope_text(envelope_b, "layer 3")?.to_string(),
            key_hash,
        })
    }
}

/// Check the binding hash carried next to envelope B.
fn verify_binding(sealed: &SealedKey) -> VaultResult<()> {
    let raw = decoded_bytes(&sealed.encrypted_private_key)
        .map_err(|_| VaultError::key_integrity("envelope B is not valid base64"))?;
    if !ct_eq(&sha256(&raw), &sealed.key_hash) {
        return Err(VaultError::key_integrity("binding hash mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trailer::LENGTH_FIELD_SIZE;
    use lockbox_storage::NoopIoHints;
    use std::sync::Arc;

    const FILE_ID: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    fn opts() -> DurableOptions {
        DurableOptions::default().with_hints(Arc::new(NoopIoHints))
    }

    fn vault(dir: &Path) -> KeyVault {
        let store = SystemKeyStore::new(dir.join("keys"), "system.bin", 1_000, 16, opts());
        KeyVault::new(store, opts())
    }

    fn payload_file(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("payload.enc");
        std::fs::write(&path, [0x5Au8; 40]).unwrap();
        path
    }

    #[test]
    fn test_seal_unseal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = vault(dir.path());
        let path = payload_file(dir.path());
        let file_key = FileKey::from_bytes([1u8; KEY_SIZE]);
        let master = MasterKey::from_bytes([2u8; KEY_SIZE]);
        let digest = [3u8; DIGEST_SIZE];

        let sealed = kv.seal(FILE_ID, &file_key, &master, &digest, &path).unwrap();
        assert_eq!(sealed.file_id, FILE_ID);
        assert_eq!(
            sealed.key_hash,
            sha256(&decoded_bytes(&sealed.encrypted_private_key).unwrap())
        );

        let (key, got_digest) = kv.unseal(FILE_ID, &master, &path).unwrap();
        assert_eq!(key.as_bytes(), file_key.as_bytes());
        assert_eq!(got_digest, digest);

        // Payload bytes in front of the trailer are untouched.
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..40], &[0x5Au8; 40]);
        let trailer = read_trailer(&path, opts()).unwrap();
        assert_eq!(raw.len() as u64, 40 + trailer.total_len());
    }

    #[test]
    fn test_wrong_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let kv = vault(dir.path());
        let path = payload_file(dir.path());
        let master = MasterKey::from_bytes([2u8; KEY_SIZE]);
        kv.seal(FILE_ID, &FileKey::from_bytes([1u8; KEY_SIZE]), &master, &[0u8; 32], &path)
            .unwrap();

        let wrong = MasterKey::from_bytes([4u8; KEY_SIZE]);
        let err = kv.unseal(FILE_ID, &wrong, &path).unwrap_err();
        assert!(matches!(err, VaultError::Authentication(_)));
        assert!(err.is_key_retrieval());
    }

    #[test]
    fn test_other_installation_cannot_unseal() {
        let dir = tempfile::tempdir().unwrap();
        let other_dir = tempfile::tempdir().unwrap();
        let path = payload_file(dir.path());
        let master = MasterKey::from_bytes([2u8; KEY_SIZE]);
        vault(dir.path())
            .seal(FILE_ID, &FileKey::from_bytes([1u8; KEY_SIZE]), &master, &[0u8; 32], &path)
            .unwrap();

        let err = vault(other_dir.path())
            .unseal(FILE_ID, &master, &path)
            .unwrap_err();
        assert!(err.is_key_retrieval());
        assert!(err.to_string().contains("layer 2"));
    }

    #[test]
    fn test_flipped_trailer_byte() {
        let dir = tempfile::tempdir().unwrap();
        let kv = vault(dir.path());
        let path = payload_file(dir.path());
        let master = MasterKey::from_bytes([2u8; KEY_SIZE]);
        kv.seal(FILE_ID, &FileKey::from_bytes([1u8; KEY_SIZE]), &master, &[0u8; 32], &path)
            .unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let blob_start = 40;
        // Swap one base64 character for another so the text stays well-formed.
        let pos = blob_start + 20;
        raw[pos] = if raw[pos] == b'A' { b'B' } else { b'A' };
        std::fs::write(&path, &raw).unwrap();

        let err = kv.unseal(FILE_ID, &master, &path).unwrap_err();
        assert!(err.is_key_retrieval(), "unexpected error: {err}");
    }

    #[test]
    fn test_binding_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let kv = vault(dir.path());
        let path = payload_file(dir.path());
        let master = MasterKey::from_bytes([2u8; KEY_SIZE]);

        // A layer-3 payload whose hash does not match envelope B.
        let envelope_b = seal(&[8u8; KEY_SIZE], b"inner").unwrap();
        let mut outer = envelope_b.into_bytes();
        outer.extend_from_slice(&[0u8; DIGEST_SIZE]);
        let blob = seal(master.as_bytes(), &outer).unwrap();
        append_trailer(&path, &blob, opts()).unwrap();

        let err = kv.unseal(FILE_ID, &master, &path).unwrap_err();
        assert!(matches!(err, VaultError::Integrity(_)));
        assert!(err.to_string().contains("binding hash mismatch"));
        assert!(
            !kv.system_keys().is_loaded(),
            "must fail before touching the system key"
        );
    }

    #[test]
    fn test_missing_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let kv = vault(dir.path());
        let path = dir.path().join("tiny");
        std::fs::write(&path, [0u8; LENGTH_FIELD_SIZE - 1]).unwrap();
        let master = MasterKey::from_bytes([2u8; KEY_SIZE]);
        assert!(matches!(
            kv.unseal(FILE_ID, &master, &path),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_seal_missing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let kv = vault(dir.path());
        let result = kv.seal(
            FILE_ID,
            &FileKey::from_bytes([1u8; KEY_SIZE]),
            &MasterKey::from_bytes([2u8; KEY_SIZE]),
            &[0u8; DIGEST_SIZE],
            &dir.path().join("absent.enc"),
        );
        assert!(matches!(result, Err(VaultError::NotFound(_))));
    }
}

//! Streaming encrypt/decrypt
//!
//! Blocks are processed strictly in order: read, seal, write, durable flush,
//! then the next block. Memory stays at O(block size) for any file size.
//!
//! Each record authenticates only itself, so a running SHA-256 over the
//! plaintext is sealed with the file key and re-checked on decrypt. That
//! catches dropped, reordered, or spliced records that every per-block tag
//! would accept.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use sha2::{Digest as _, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use lockbox_core::config::{StorageConfig, DEFAULT_BLOCK_SIZE};
use lockbox_core::{Digest, Outcome, ProcessingRequest, VaultError, VaultResult};
use lockbox_crypto::{
    ct_eq, derive_block_nonce, generate_base_nonce, generate_file_key, FileKey, IntegrityGate,
    MasterKey, NONCE_SIZE, TAG_SIZE,
};
use lockbox_storage::{DurableFile, DurableOptions};
use lockbox_vault::{read_trailer, KeyVault, Trailer};

use crate::progress::ProgressSink;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Plaintext bytes per record. Not stored in the file: decrypt must use
    /// the value encrypt used.
    pub block_size: usize,
    pub durable: DurableOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            durable: DurableOptions::default(),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &StorageConfig, gate: Option<Arc<IntegrityGate>>) -> Self {
        Self {
            block_size: config.block_size,
            durable: DurableOptions::from_config(config, gate),
        }
    }
}

/// Statistics from a completed encryption
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EncryptSummary {
    pub blocks: u64,
    pub plaintext_bytes: u64,
    /// Base nonce plus records, trailer excluded
    pub payload_bytes: u64,
    pub trailer_bytes: u64,
}

/// Statistics from a completed decryption
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecryptSummary {
    pub blocks: u64,
    pub plaintext_bytes: u64,
}

/// Size of the payload (base nonce plus records) for a plaintext length.
pub fn payload_len(plaintext_len: u64, block_size: usize) -> u64 {
    let records = plaintext_len.div_ceil(block_size as u64);
    NONCE_SIZE as u64 + records * TAG_SIZE as u64 + plaintext_len
}

fn block_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 90;
    }
    (10 + done.min(total) * 80 / total) as u8
}

/// Read until `buf` is full or the reader is exhausted.
fn read_block(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn source_len(path: &Path) -> VaultResult<u64> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Err(VaultError::NotFound(format!(
            "{} is not a regular file",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(VaultError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Sibling path the decryptor writes to before the digest check passes.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

pub struct StorageEngine {
    vault: Arc<KeyVault>,
    gate: Arc<IntegrityGate>,
    options: EngineOptions,
}

impl StorageEngine {
    /// Every durable flush made by the engine is gated on `gate`.
    pub fn new(vault: Arc<KeyVault>, gate: Arc<IntegrityGate>, mut options: EngineOptions) -> Self {
        options.durable.gate = Some(gate.clone());
        Self {
            vault,
            gate,
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    /// Encrypt `request.source_path` into `request.destination_path`.
    ///
    /// On error the file key is wiped and whatever was written stays on disk
    /// without a trailer.
    pub fn encrypt(
        &self,
        request: &ProcessingRequest,
        master: &MasterKey,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> VaultResult<Outcome> {
        let file_id = request.file_id.as_str();
        let result = self.run_encrypt(request, master, cancel, progress);
        match &result {
            Ok(Outcome::Completed) => {}
            Ok(Outcome::Cancelled) => info!(
                file_id,
                dest = %request.destination_path.display(),
                "encryption cancelled; partial output left in place"
            ),
            Err(e) => error!(file_id, "encryption failed: {e}"),
        }
        result
    }

    /// Decrypt `request.source_path` into `request.destination_path`.
    ///
    /// Plaintext goes to a `.partial` sibling and is renamed into place only
    /// after the whole-file digest matches. Any failure removes the partial
    /// file. Cancellation leaves it, and its content is unverified.
    pub fn decrypt(
        &self,
        request: &ProcessingRequest,
        master: &MasterKey,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> VaultResult<Outcome> {
        let file_id = request.file_id.as_str();
        let partial = partial_path(&request.destination_path);
        let result = self.run_decrypt(request, master, cancel, progress, &partial);
        match &result {
            Ok(Outcome::Completed) => {}
            Ok(Outcome::Cancelled) => info!(
                file_id,
                partial = %partial.display(),
                "decryption cancelled; partial output left in place"
            ),
            Err(e) => {
                error!(file_id, "decryption failed: {e}");
                match std::fs::remove_file(&partial) {
                    Ok(()) => debug!(path = %partial.display(), "removed untrusted output"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %partial.display(), "failed to remove output: {e}"),
                }
            }
        }
        result
    }

    fn run_encrypt(
        &self,
        request: &ProcessingRequest,
        master: &MasterKey,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> VaultResult<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        self.gate.ensure()?;

        let file_id = request.file_id.as_str();
        let source = &request.source_path;
        let dest = &request.destination_path;
        let plaintext_len = source_len(source)?;
        let block_size = self.options.block_size;
        let total_blocks = plaintext_len.div_ceil(block_size as u64);

        progress.report(0, "Starting encryption...");
        debug!(
            file_id,
            source = %source.display(),
            dest = %dest.display(),
            plaintext_len,
            block_size,
            "encrypt start"
        );

        let file_key = generate_file_key();
        let base_nonce = generate_base_nonce();
        let cipher = Aes256Gcm::new(file_key.as_bytes().into());

        let mut input = DurableFile::open_read(source, self.options.durable.clone())?;
        let mut output = DurableFile::create(dest, self.options.durable.clone())?;
        output.write_all(&base_nonce)?;
        output.durable_flush()?;

        progress.report(5, "Processing file...");

        let mut hasher = Sha256::new();
        let mut buf = Zeroizing::new(vec![0u8; block_size]);
        let mut work: Zeroizing<Vec<u8>> = Zeroizing::new(Vec::with_capacity(block_size));
        let mut summary = EncryptSummary::default();

        loop {
            if cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let n = read_block(&mut input, &mut buf)?;
            if n == 0 {
                break;
            }
            let plain = &buf[..n];
            hasher.update(plain);

            let nonce = derive_block_nonce(&base_nonce, summary.blocks)?;
            work.clear();
            work.extend_from_slice(plain);
            let tag = cipher
                .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut work)
                .map_err(|_| {
                    VaultError::Crypto(format!("sealing block {} failed", summary.blocks))
                })?;

            output.write_all(tag.as_slice())?;
            output.write_all(&work)?;
            output.durable_flush()?;

            summary.blocks += 1;
            summary.plaintext_bytes += n as u64;
            progress.report(
                block_percent(summary.blocks, total_blocks),
                &format!(
                    "Processing block {} of {}...",
                    summary.blocks,
                    total_blocks.max(summary.blocks)
                ),
            );
        }

        summary.payload_bytes = output.len()?;
        output.close();
        input.close();

        let digest: Digest = hasher.finalize().into();

        progress.report(95, "Storing encryption key and hash...");
        self.seal_key(file_id, &file_key, master, &digest, dest)?;
        summary.trailer_bytes = std::fs::metadata(dest)?.len() - summary.payload_bytes;

        progress.report(100, "Encryption completed");
        info!(
            file_id,
            blocks = summary.blocks,
            plaintext_bytes = summary.plaintext_bytes,
            payload_bytes = summary.payload_bytes,
            trailer_bytes = summary.trailer_bytes,
            "encryption completed"
        );
        Ok(Outcome::Completed)
    }

    fn run_decrypt(
        &self,
        request: &ProcessingRequest,
        master: &MasterKey,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
        partial: &Path,
    ) -> VaultResult<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        self.gate.ensure()?;

        let file_id = request.file_id.as_str();
        let source = &request.source_path;
        let dest = &request.destination_path;
        source_len(source)?;

        progress.report(0, "Starting decryption...");

        let trailer = read_trailer(source, self.options.durable.clone())?;
        let mut input = DurableFile::open_read(source, self.options.durable.clone())?;
        let file_len = input.len()?;
        let payload = file_len.saturating_sub(trailer.total_len());
        if payload < NONCE_SIZE as u64 {
            return Err(VaultError::Integrity(format!(
                "payload is {payload} bytes, shorter than the base nonce"
            )));
        }

        let (file_key, expected) = self.unseal_key(file_id, master, &trailer)?;
        progress.report(5, "Retrieved encryption key and hash...");

        let block_size = self.options.block_size;
        let record_size = (block_size + TAG_SIZE) as u64;
        let body = payload - NONCE_SIZE as u64;
        let total_blocks = body.div_ceil(record_size);
        debug!(file_id, file_len, payload, total_blocks, "decrypt start");

        let mut base_nonce = [0u8; NONCE_SIZE];
        input.read_exact(&mut base_nonce)?;

        let cipher = Aes256Gcm::new(file_key.as_bytes().into());
        let mut output = DurableFile::create(partial, self.options.durable.clone())?;

        progress.report(10, "Processing file...");

        let mut hasher = Sha256::new();
        let mut record: Zeroizing<Vec<u8>> =
            Zeroizing::new(Vec::with_capacity(block_size + TAG_SIZE));
        let mut remaining = body;
        let mut summary = DecryptSummary::default();

        while remaining > 0 {
            if cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let len = remaining.min(record_size) as usize;
            if len <= TAG_SIZE {
                return Err(VaultError::Integrity(format!(
                    "record {} is truncated ({len} bytes)",
                    summary.blocks
                )));
            }
            record.resize(len, 0);
            input.read_exact(&mut record)?;

            let nonce = derive_block_nonce(&base_nonce, summary.blocks)?;
            let (tag, data) = record.split_at_mut(TAG_SIZE);
            cipher
                .decrypt_in_place_detached(Nonce::from_slice(&nonce), b"", data, Tag::from_slice(tag))
                .map_err(|_| {
                    VaultError::Authentication(format!(
                        "block {} did not authenticate",
                        summary.blocks
                    ))
                })?;

            hasher.update(&*data);
            output.write_all(data)?;
            output.durable_flush()?;

            remaining -= len as u64;
            summary.blocks += 1;
            summary.plaintext_bytes += data.len() as u64;
            progress.report(
                block_percent(summary.blocks, total_blocks),
                &format!("Processing block {} of {}...", summary.blocks, total_blocks),
            );
        }
        input.close();

        progress.report(95, "Verifying content hash...");
        let actual: Digest = hasher.finalize().into();
        if !ct_eq(&actual, &expected) {
            return Err(VaultError::Integrity("content digest mismatch".into()));
        }

        output.durable_flush()?;
        output.close();
        std::fs::rename(partial, dest)?;

        progress.report(100, "Decryption completed");
        info!(
            file_id,
            blocks = summary.blocks,
            plaintext_bytes = summary.plaintext_bytes,
            dest = %dest.display(),
            "decryption completed"
        );
        Ok(Outcome::Completed)
    }
}

impl StorageEngine {
    /// Key material crosses the vault only after the gate passes.
    fn seal_key(
        &self,
        file_id: &str,
        file_key: &FileKey,
        master: &MasterKey,
        digest: &Digest,
        dest: &Path,
    ) -> VaultResult<()> {
        self.gate.ensure()?;
        self.vault.seal(file_id, file_key, master, digest, dest)?;
        Ok(())
    }

    fn unseal_key(
        &self,
        file_id: &str,
        master: &MasterKey,
        trailer: &Trailer,
    ) -> VaultResult<(FileKey, Digest)> {
        self.gate.ensure()?;
        self.vault.open_trailer(file_id, master, trailer)
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("block_size", &self.options.block_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockbox_crypto::gate::GATE_SIZE;
    use lockbox_storage::NoopIoHints;
    use lockbox_vault::SystemKeyStore;

    #[test]
    fn test_payload_len() {
        assert_eq!(payload_len(0, 16), 12);
        assert_eq!(payload_len(1, 16), 12 + 16 + 1);
        assert_eq!(payload_len(16, 16), 12 + 16 + 16);
        assert_eq!(payload_len(17, 16), 12 + 32 + 17);
        assert_eq!(
            payload_len(DEFAULT_BLOCK_SIZE as u64 * 3, DEFAULT_BLOCK_SIZE),
            12 + 3 * 16 + DEFAULT_BLOCK_SIZE as u64 * 3
        );
    }

    #[test]
    fn test_block_percent_bounds() {
        assert_eq!(block_percent(0, 0), 90);
        assert_eq!(block_percent(1, 1), 90);
        assert_eq!(block_percent(1, 4), 30);
        assert_eq!(block_percent(9, 4), 90);
    }

    #[test]
    fn test_read_block_fills_from_short_reads() {
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = self.0.len().min(buf.len()).min(3);
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }
        let data: Vec<u8> = (0..20).collect();
        let mut reader = Trickle(&data);
        let mut buf = [0u8; 8];
        assert_eq!(read_block(&mut reader, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(read_block(&mut reader, &mut buf).unwrap(), 8);
        assert_eq!(read_block(&mut reader, &mut buf).unwrap(), 4);
        assert_eq!(read_block(&mut reader, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_options_from_config() {
        let config = StorageConfig {
            block_size: 4096,
            ..StorageConfig::default()
        };
        let gate = Arc::new(IntegrityGate::new());
        let opts = EngineOptions::from_config(&config, Some(gate));
        assert_eq!(opts.block_size, 4096);
        assert!(opts.durable.gate.is_some());
        assert!(EngineOptions::from_config(&config, None).durable.gate.is_none());
    }

    fn tampered_engine(dir: &Path) -> StorageEngine {
        let durable = DurableOptions::default().with_hints(Arc::new(NoopIoHints));
        let store = SystemKeyStore::new(dir.join("keys"), "sp.bin", 1_000, 16, durable.clone());
        let gate = IntegrityGate::from_parts([0u8; GATE_SIZE], [0u8; GATE_SIZE]);
        StorageEngine::new(
            Arc::new(KeyVault::new(store, durable.clone())),
            Arc::new(gate),
            EngineOptions {
                block_size: 64,
                durable,
            },
        )
    }

    #[test]
    fn test_unseal_checks_gate_before_vault() {
        let dir = tempfile::tempdir().unwrap();
        let engine = tampered_engine(dir.path());
        let trailer = Trailer {
            blob: "bm90IGEgcmVhbCB0cmFpbGVy".into(),
        };
        let result = engine.unseal_key("id", &MasterKey::from_bytes([1u8; 32]), &trailer);
        assert!(matches!(result, Err(VaultError::TamperDetected)));
        assert!(!engine.vault().system_keys().is_loaded());
    }

    #[test]
    fn test_seal_checks_gate_before_vault() {
        let dir = tempfile::tempdir().unwrap();
        let engine = tampered_engine(dir.path());
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, [0u8; 12]).unwrap();
        let result = engine.seal_key(
            "id",
            &FileKey::from_bytes([2u8; 32]),
            &MasterKey::from_bytes([1u8; 32]),
            &[0u8; 32],
            &dest,
        );
        assert!(matches!(result, Err(VaultError::TamperDetected)));
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 12);
        assert!(!engine.vault().system_keys().is_loaded());
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/tmp/bare/report.pdf")),
            PathBuf::from("/tmp/bare/report.pdf.partial")
        );
    }

    #[test]
    fn test_missing_source_is_not_found() {
        let dir = std::env::temp_dir().join("lockbox-engine-no-such-dir");
        assert!(matches!(
            source_len(&dir.join("missing.bin")),
            Err(VaultError::NotFound(_))
        ));
    }
}

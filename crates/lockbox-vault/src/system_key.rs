//! Install-local system key
//!
//! The key is derived once per installation (PBKDF2 over random bytes),
//! written raw to the key-store file, and loaded unchanged afterwards.
//! Losing the file makes every trailer sealed under it unrecoverable.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use lockbox_core::config::KeyVaultConfig;
use lockbox_core::{VaultError, VaultResult};
use lockbox_crypto::keys::stretch_random_key;
use lockbox_crypto::{SystemKey, KEY_SIZE};
use lockbox_storage::{DurableFile, DurableOptions};

pub struct SystemKeyStore {
    path: PathBuf,
    iterations: u32,
    salt_size: usize,
    durable: DurableOptions,
    key: OnceCell<SystemKey>,
}

impl SystemKeyStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        file_name: &str,
        iterations: u32,
        salt_size: usize,
        durable: DurableOptions,
    ) -> Self {
        Self {
            path: dir.into().join(file_name),
            iterations,
            salt_size,
            durable,
            key: OnceCell::new(),
        }
    }

    pub fn from_config(config: &KeyVaultConfig, durable: DurableOptions) -> Self {
        Self::new(
            config.key_store_dir.clone(),
            &config.key_file_name,
            config.pbkdf2_iterations,
            config.salt_size,
            durable,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.key.get().is_some()
    }

    /// The system key, loading or creating it on first call.
    ///
    /// Concurrent first calls block until one of them finishes; the slow
    /// derivation runs at most once per process.
    pub fn key(&self) -> VaultResult<&SystemKey> {
        self.key.get_or_try_init(|| self.load_or_create())
    }

    fn load_or_create(&self) -> VaultResult<SystemKey> {
        if self.path.exists() {
            return self.load();
        }
        self.create()
    }

    fn load(&self) -> VaultResult<SystemKey> {
        let raw = Zeroizing::new(std::fs::read(&self.path).map_err(|e| {
            VaultError::KeyStore(format!("reading {}: {e}", self.path.display()))
        })?);
        let key = SystemKey::from_slice(&raw).ok_or_else(|| {
            VaultError::KeyStore(format!(
                "{} holds {} bytes, expected {KEY_SIZE}",
                self.path.display(),
                raw.len()
            ))
        })?;
        debug!(path = %self.path.display(), "system key loaded");
        Ok(key)
    }

    fn create(&self) -> VaultResult<SystemKey> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .map_err(|e| VaultError::KeyStore(format!("creating {}: {e}", dir.display())))?;

        info!(
            path = %self.path.display(),
            iterations = self.iterations,
            "generating system key (first run)"
        );
        let derived = stretch_random_key(self.iterations, self.salt_size);

        let tmp = self.temp_path();
        let installed = self.install(&tmp, derived.as_ref());
        if let Err(e) = std::fs::remove_file(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "leaving system key temp file behind");
            }
        }

        match installed {
            Ok(()) => {
                sync_dir(dir)?;
                Ok(SystemKey::fill_with(|bytes| bytes.copy_from_slice(derived.as_ref())))
            }
            Err(VaultError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                info!(path = %self.path.display(), "system key installed concurrently, loading it");
                self.load()
            }
            Err(e) => Err(e),
        }
    }

    /// Unique sibling of the key file, so concurrent creators never share it.
    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path
            .with_file_name(format!("{name}.{}.tmp", uuid::Uuid::new_v4()))
    }

    /// Write the key durably to `tmp`, then link it into place.
    ///
    /// The link fails with `AlreadyExists` if another creator won; the key
    /// file never appears half-written and is never replaced.
    fn install(&self, tmp: &Path, bytes: &[u8]) -> VaultResult<()> {
        let mut out = DurableFile::create_private(tmp, self.durable.clone())?;
        out.write_all(bytes)?;
        out.durable_flush()?;
        out.close();
        std::fs::hard_link(tmp, &self.path)?;
        Ok(())
    }
}

/// Persist the directory entry of a freshly installed key file.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> VaultResult<()> {
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(VaultError::Durability)
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> VaultResult<()> {
    Ok(())
}

impl std::fmt::Debug for SystemKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemKeyStore")
            .field("path", &self.path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockbox_storage::NoopIoHints;
    use std::sync::Arc;

    fn store(dir: &Path) -> SystemKeyStore {
        SystemKeyStore::new(
            dir.join("lockedbox"),
            "sp_80038b.bin",
            1_000,
            16,
            DurableOptions::default().with_hints(Arc::new(NoopIoHints)),
        )
    }

    #[test]
    fn test_first_use_creates_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(!s.path().exists());
        assert!(!s.is_loaded());

        let key = s.key().unwrap().as_bytes().to_owned();
        assert!(s.is_loaded());
        assert_eq!(std::fs::read(s.path()).unwrap(), key);
        let leftovers: Vec<_> = std::fs::read_dir(s.path().parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }

    #[test]
    fn test_key_is_stable_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let first = store(dir.path()).key().unwrap().as_bytes().to_owned();
        let second = store(dir.path()).key().unwrap().as_bytes().to_owned();
        assert_eq!(first, second);
    }

    #[test]
    fn test_load_once() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let a = s.key().unwrap() as *const SystemKey;
        std::fs::remove_file(s.path()).unwrap();
        let b = s.key().unwrap() as *const SystemKey;
        assert_eq!(a, b, "second call must not touch the disk");
    }

    #[test]
    fn test_wrong_size_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        std::fs::create_dir_all(s.path().parent().unwrap()).unwrap();
        std::fs::write(s.path(), [9u8; 16]).unwrap();

        assert!(matches!(s.key(), Err(VaultError::KeyStore(_))));
        assert_eq!(std::fs::read(s.path()).unwrap(), vec![9u8; 16]);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.key().unwrap();
        let mode = std::fs::metadata(s.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_concurrent_first_run_agrees_on_disk_key() {
        use std::sync::Barrier;

        for _ in 0..5 {
            let dir = tempfile::tempdir().unwrap();
            let barrier = Barrier::new(2);
            let keys: Vec<Vec<u8>> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..2)
                    .map(|_| {
                        let barrier = &barrier;
                        let root = dir.path();
                        scope.spawn(move || {
                            let s = store(root);
                            barrier.wait();
                            let key = s.key().unwrap();
                            key.as_bytes().to_vec()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let on_disk = std::fs::read(store(dir.path()).path()).unwrap();
            for key in &keys {
                assert_eq!(key, &on_disk, "handed out a key that is not on disk");
            }
        }
    }

    #[test]
    fn test_existing_key_file_wins_over_new_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        std::fs::create_dir_all(s.path().parent().unwrap()).unwrap();
        std::fs::write(s.path(), [5u8; KEY_SIZE]).unwrap();

        // A creator that lost the race must adopt the installed key.
        let adopted = s.create().unwrap();
        assert_eq!(adopted.as_bytes(), &[5u8; KEY_SIZE]);
        assert_eq!(std::fs::read(s.path()).unwrap(), vec![5u8; KEY_SIZE]);
    }
}

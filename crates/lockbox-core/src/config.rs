use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{VaultError, VaultResult};

/// Default plaintext bytes per AEAD record (80 KiB)
pub const DEFAULT_BLOCK_SIZE: usize = 81920;

/// Largest accepted block size; keeps per-call memory bounded
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Top-level configuration (loaded from lockbox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockboxConfig {
    pub storage: StorageConfig,
    pub keyvault: KeyVaultConfig,
    pub vault: VaultDirsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Plaintext bytes per AEAD record (default: 81920)
    pub block_size: usize,
    /// Advise the kernel that files are read/written sequentially
    pub sequential_hint: bool,
    /// Advise the kernel to drop the written range from cache after each durable flush
    pub drop_cache_after_flush: bool,
    /// Try to raise the process I/O scheduling class when a file is opened
    pub elevate_io_priority: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyVaultConfig {
    /// Directory holding the system key file
    pub key_store_dir: PathBuf,
    /// File name of the raw system key
    pub key_file_name: String,
    /// PBKDF2-HMAC-SHA512 iterations used to stretch the system key
    pub pbkdf2_iterations: u32,
    /// Salt size in bytes for the system key stretch
    pub salt_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultDirsConfig {
    /// Output directory for encrypted files
    pub encrypted_dir: PathBuf,
    /// Output directory for decrypted files
    pub decrypted_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            sequential_hint: true,
            drop_cache_after_flush: true,
            elevate_io_priority: true,
        }
    }
}

impl Default for KeyVaultConfig {
    fn default() -> Self {
        Self {
            key_store_dir: PathBuf::from("lockedbox"),
            key_file_name: "sp_80038b.bin".into(),
            pbkdf2_iterations: 600_000,
            salt_size: 64,
        }
    }
}

impl Default for VaultDirsConfig {
    fn default() -> Self {
        Self {
            encrypted_dir: PathBuf::from("seal"),
            decrypted_dir: PathBuf::from("bare"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl KeyVaultConfig {
    /// Full path of the system key file
    pub fn key_file_path(&self) -> PathBuf {
        self.key_store_dir.join(&self.key_file_name)
    }
}

impl LockboxConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml(content: &str) -> VaultResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| VaultError::Config(format!("parsing: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields defaults.
    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.storage.block_size == 0 || self.storage.block_size > MAX_BLOCK_SIZE {
            return Err(VaultError::Config(format!(
                "storage.block_size must be in 1..={MAX_BLOCK_SIZE}, got {}",
                self.storage.block_size
            )));
        }
        if self.keyvault.pbkdf2_iterations == 0 {
            return Err(VaultError::Config(
                "keyvault.pbkdf2_iterations must be non-zero".into(),
            ));
        }
        if self.keyvault.salt_size < 16 {
            return Err(VaultError::Config(format!(
                "keyvault.salt_size must be at least 16 bytes, got {}",
                self.keyvault.salt_size
            )));
        }
        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(VaultError::Config(format!(
                "logging.format must be \"json\" or \"text\", got {other:?}"
            ))),
        }
    }
}

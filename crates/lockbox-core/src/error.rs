use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

/// Failure taxonomy shared by every lockbox crate.
///
/// Cancellation is deliberately absent: a cancelled operation returns
/// [`crate::Outcome::Cancelled`] instead of an error.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Source file or key trailer missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// AEAD tag mismatch.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Whole-file digest or binding-hash mismatch, or a structurally broken file.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The sync barrier did not confirm the write.
    #[error("durability failure: {0}")]
    Durability(#[source] std::io::Error),

    #[error("tamper detected: in-memory integrity gate failed")]
    TamperDetected,

    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),

    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message prefix used for every failure raised while unsealing a trailer.
pub const KEY_RETRIEVAL: &str = "key retrieval";

impl VaultError {
    /// True when the error came out of unsealing a key trailer.
    pub fn is_key_retrieval(&self) -> bool {
        match self {
            VaultError::Authentication(msg) | VaultError::Integrity(msg) => {
                msg.starts_with(KEY_RETRIEVAL)
            }
            _ => false,
        }
    }

    /// Build an authentication failure attributed to key retrieval.
    pub fn key_auth(layer: &str) -> Self {
        VaultError::Authentication(format!("{KEY_RETRIEVAL}: {layer} did not authenticate"))
    }

    /// Build an integrity failure attributed to key retrieval.
    pub fn key_integrity(detail: &str) -> Self {
        VaultError::Integrity(format!("{KEY_RETRIEVAL}: {detail}"))
    }
}

use std::fmt;
use std::path::PathBuf;

/// SHA-256 digest (whole-file plaintext digest or envelope binding hash)
pub type Digest = [u8; 32];

/// One encrypt or decrypt call. Created per call, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingRequest {
    /// Opaque correlation token linking a source file to its sealed key
    pub file_id: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
}

impl ProcessingRequest {
    pub fn new(
        file_id: impl Into<String>,
        source_path: impl Into<PathBuf>,
        destination_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            source_path: source_path.into(),
            destination_path: destination_path.into(),
        }
    }
}

/// A file key after the first two wrapping layers.
///
/// Lives only inside the trailer of the encrypted file it belongs to.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedKey {
    pub file_id: String,
    /// Text-encoded envelope B (system-key layer around the master-key layer)
    pub encrypted_private_key: String,
    /// SHA-256 of the decoded bytes of `encrypted_private_key`
    pub key_hash: Digest,
}

impl fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedKey")
            .field("file_id", &self.file_id)
            .field("encrypted_private_key_len", &self.encrypted_private_key.len())
            .finish()
    }
}

/// Terminal state of an operation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Stopped at a block boundary; partial output is left in place.
    Cancelled,
}

/// A single progress event: percentage in 0..=100 plus a phase message.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

/// User-facing status of an operation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Ready,
    Completed,
    Canceled,
    Failed(String),
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Ready => f.write_str("Ready"),
            OperationStatus::Completed => f.write_str("Completed"),
            OperationStatus::Canceled => f.write_str("Canceled"),
            OperationStatus::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

impl From<Outcome> for OperationStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => OperationStatus::Completed,
            Outcome::Cancelled => OperationStatus::Canceled,
        }
    }
}

// ── File name convention ──────────────────────────────────────────────────────
//
// Encrypted output is named `<original-name>_<file-id>`; the id is a UUID and
// is only an external correlation token.

/// Generate a fresh file id.
pub fn new_file_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Append `_<file_id>` to a file name.
pub fn tag_file_name(name: &str, file_id: &str) -> String {
    format!("{name}_{file_id}")
}

/// Split `<name>_<id>` into `(name, id)`.
///
/// Returns `None` when there is no underscore, the name part is empty, or the
/// id part is empty.
pub fn split_file_id(file_name: &str) -> Option<(&str, &str)> {
    let idx = file_name.rfind('_')?;
    if idx == 0 || idx == file_name.len() - 1 {
        return None;
    }
    Some((&file_name[..idx], &file_name[idx + 1..]))
}

/// True when the name already ends in `_<uuid>`.
pub fn is_tagged(file_name: &str) -> bool {
    split_file_id(file_name)
        .map(|(_, id)| uuid::Uuid::parse_str(id).is_ok())
        .unwrap_or(false)
}

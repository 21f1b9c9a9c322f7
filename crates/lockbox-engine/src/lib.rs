//! lockbox-engine: the streaming encrypt/decrypt pipeline
//!
//! Encrypted file layout (integers little-endian):
//! ```text
//! [12-byte base nonce]
//! { [16-byte tag][ciphertext, <= block_size] }   repeated
//! [key trailer blob][u32 blob length]
//! ```

pub mod engine;
pub mod progress;

pub use engine::{DecryptSummary, EncryptSummary, EngineOptions, StorageEngine};
pub use progress::{NoProgress, ProgressFn, ProgressSink};
pub use tokio_util::sync::CancellationToken;

//! lockbox-storage: durable file handles
//!
//! [`DurableFile`] wraps a `std::fs::File` so that a returned flush means the
//! bytes reached physical storage. Kernel hints (sequential access, cache
//! eviction, I/O priority) go through the [`IoHints`] capability so platforms
//! without them fall back to no-ops.

pub mod durable;
pub mod hints;

pub use durable::{DurableFile, DurableOptions};
pub use hints::{default_hints, IoHints, NoopIoHints};

#[cfg(target_os = "linux")]
pub use hints::LinuxIoHints;

//! File handle whose flush means "on physical storage"
//!
//! Flush sequence: buffered flush, sync barrier, then an optional hint that
//! the written range can leave the page cache. Flushes are single-flight per
//! handle: a flush that finds another one running returns immediately.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use lockbox_core::config::StorageConfig;
use lockbox_core::{VaultError, VaultResult};
use lockbox_crypto::IntegrityGate;

use crate::hints::{default_hints, IoHints};

/// How a [`DurableFile`] uses the platform hints and the integrity gate.
#[derive(Debug, Clone)]
pub struct DurableOptions {
    pub hints: Arc<dyn IoHints>,
    /// Checked before every durable flush when present
    pub gate: Option<Arc<IntegrityGate>>,
    pub sequential: bool,
    pub drop_cache: bool,
    pub elevate_priority: bool,
}

impl Default for DurableOptions {
    fn default() -> Self {
        Self {
            hints: default_hints(),
            gate: None,
            sequential: true,
            drop_cache: true,
            elevate_priority: true,
        }
    }
}

impl DurableOptions {
    pub fn from_config(config: &StorageConfig, gate: Option<Arc<IntegrityGate>>) -> Self {
        Self {
            hints: default_hints(),
            gate,
            sequential: config.sequential_hint,
            drop_cache: config.drop_cache_after_flush,
            elevate_priority: config.elevate_io_priority,
        }
    }

    pub fn with_hints(mut self, hints: Arc<dyn IoHints>) -> Self {
        self.hints = hints;
        self
    }
}

pub struct DurableFile {
    file: Option<File>,
    path: PathBuf,
    flushing: AtomicBool,
    /// End of the range already confirmed by a flush.
    flushed: AtomicU64,
    options: DurableOptions,
}

/// Clears the single-flight flag on every exit path.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "file closed")
}

impl DurableFile {
    /// Open an existing file for reading.
    pub fn open_read(path: &Path, options: DurableOptions) -> VaultResult<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                VaultError::NotFound(path.display().to_string())
            } else {
                VaultError::Io(e)
            }
        })?;
        Ok(Self::wrap(file, path, options))
    }

    /// Create (or truncate) a file for writing.
    pub fn create(path: &Path, options: DurableOptions) -> VaultResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::wrap(file, path, options))
    }

    /// Create a new file readable only by the owner (mode 0600 on Unix).
    ///
    /// Fails with `AlreadyExists` rather than reuse an existing file.
    pub fn create_private(path: &Path, options: DurableOptions) -> VaultResult<Self> {
        let mut open = OpenOptions::new();
        open.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open.mode(0o600);
        }
        let file = open.open(path)?;
        Ok(Self::wrap(file, path, options))
    }

    /// Open an existing file positioned at its end.
    pub fn open_append(path: &Path, options: DurableOptions) -> VaultResult<Self> {
        let file = OpenOptions::new().append(true).open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                VaultError::NotFound(path.display().to_string())
            } else {
                VaultError::Io(e)
            }
        })?;
        Ok(Self::wrap(file, path, options))
    }

    fn wrap(file: File, path: &Path, options: DurableOptions) -> Self {
        if options.elevate_priority {
            options.hints.elevate_priority();
        }
        if let Some(gate) = &options.gate {
            gate.scramble_padding();
        }
        if options.sequential {
            options.hints.advise_sequential(&file);
        }
        let existing = file.metadata().map(|m| m.len()).unwrap_or(0);
        trace!(path = %path.display(), existing, "durable file opened");
        Self {
            file: Some(file),
            path: path.to_path_buf(),
            flushing: AtomicBool::new(false),
            flushed: AtomicU64::new(existing),
            options,
        }
    }

    fn handle(&self) -> io::Result<&File> {
        self.file.as_ref().ok_or_else(closed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub fn len(&self) -> VaultResult<u64> {
        Ok(self.handle()?.metadata()?.len())
    }

    pub fn is_empty(&self) -> VaultResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush and block until the data is confirmed on physical media.
    ///
    /// Returns immediately when another flush on this handle is in progress.
    /// A failed sync barrier is a `Durability` error and the write must be
    /// treated as unconfirmed.
    pub fn durable_flush(&self) -> VaultResult<()> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(path = %self.path.display(), "flush already in progress");
            return Ok(());
        }
        let _guard = FlushGuard(&self.flushing);

        if let Some(gate) = &self.options.gate {
            gate.ensure()?;
        }

        let mut file = self.handle()?;
        file.flush()?;
        self.options
            .hints
            .sync_barrier(file)
            .map_err(VaultError::Durability)?;

        let len = file.metadata()?.len();
        let start = self.flushed.swap(len, Ordering::AcqRel);
        if self.options.drop_cache && len > start {
            self.options.hints.advise_dont_need(file, start, len - start);
        }
        if let Some(gate) = &self.options.gate {
            gate.scramble_padding();
        }
        Ok(())
    }

    /// Release the handle. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            debug!(path = %self.path.display(), "durable file closed");
        }
    }
}

impl Drop for DurableFile {
    fn drop(&mut self) {
        self.close();
    }
}

impl Read for DurableFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.as_mut().ok_or_else(closed)?.read(buf)
    }
}

impl Write for DurableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.as_mut().ok_or_else(closed)?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.durable_flush().map_err(|e| match e {
            VaultError::Io(e) | VaultError::Durability(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        })
    }
}

impl Seek for DurableFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.as_mut().ok_or_else(closed)?.seek(pos)
    }
}

impl std::fmt::Debug for DurableFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableFile")
            .field("path", &self.path)
            .field("closed", &self.file.is_none())
            .finish()
    }
}

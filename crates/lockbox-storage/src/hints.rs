//! OS I/O hints behind a small capability trait
//!
//! Every hint is advisory. A failed hint is logged and the operation
//! continues; only `sync_barrier` can fail a write.

use std::fs::File;
use std::io;
use std::sync::Arc;

/// Platform I/O capabilities used by [`crate::DurableFile`].
pub trait IoHints: Send + Sync + std::fmt::Debug {
    /// Tell the kernel the file will be accessed sequentially.
    fn advise_sequential(&self, file: &File);

    /// Tell the kernel `len` bytes starting at `offset` need not stay cached.
    fn advise_dont_need(&self, file: &File, offset: u64, len: u64);

    /// Best-effort raise of the process I/O scheduling class.
    fn elevate_priority(&self);

    /// Force written data to physical media.
    fn sync_barrier(&self, file: &File) -> io::Result<()> {
        file.sync_all()
    }
}

/// Hints for platforms without the primitives. The sync barrier is kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIoHints;

impl IoHints for NoopIoHints {
    fn advise_sequential(&self, _file: &File) {}
    fn advise_dont_need(&self, _file: &File, _offset: u64, _len: u64) {}
    fn elevate_priority(&self) {}
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    use once_cell::sync::OnceCell;
    use tracing::{debug, warn};

    use super::IoHints;

    const IOPRIO_WHO_PROCESS: libc::c_int = 1;
    const IOPRIO_CLASS_SHIFT: libc::c_int = 13;
    const IOPRIO_CLASS_RT: libc::c_int = 1;
    const IOPRIO_CLASS_BE: libc::c_int = 2;

    /// `posix_fadvise` and `ioprio_set` through libc.
    #[derive(Debug, Default)]
    pub struct LinuxIoHints {
        // ioprio_set applies to the whole process; attempt it once.
        priority: OnceCell<Option<&'static str>>,
    }

    impl LinuxIoHints {
        pub fn new() -> Self {
            Self::default()
        }

        fn fadvise(file: &File, offset: u64, len: u64, advice: libc::c_int, name: &str) {
            let fd = file.as_raw_fd();
            let (Ok(offset), Ok(len)) = (libc::off_t::try_from(offset), libc::off_t::try_from(len))
            else {
                warn!(fd, offset, len, advice = name, "fadvise range out of bounds");
                return;
            };
            // SAFETY: fd is owned by `file` and stays open for the call.
            let rc = unsafe { libc::posix_fadvise(fd, offset, len, advice) };
            if rc != 0 {
                warn!(fd, offset, len, rc, advice = name, "posix_fadvise failed");
            }
        }

        fn try_ioprio(class: libc::c_int) -> bool {
            // Priority level 0 within the class.
            let value = class << IOPRIO_CLASS_SHIFT;
            // SAFETY: ioprio_set takes plain integers and touches no memory.
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_ioprio_set,
                    IOPRIO_WHO_PROCESS,
                    0 as libc::c_int,
                    value,
                )
            };
            rc == 0
        }
    }

    impl IoHints for LinuxIoHints {
        fn advise_sequential(&self, file: &File) {
            let len = file.metadata().map(|m| m.len()).unwrap_or(0);
            Self::fadvise(file, 0, len, libc::POSIX_FADV_SEQUENTIAL, "sequential");
        }

        fn advise_dont_need(&self, file: &File, offset: u64, len: u64) {
            Self::fadvise(file, offset, len, libc::POSIX_FADV_DONTNEED, "dontneed");
        }

        fn elevate_priority(&self) {
            self.priority.get_or_init(|| {
                let class = if Self::try_ioprio(IOPRIO_CLASS_RT) {
                    Some("realtime")
                } else if Self::try_ioprio(IOPRIO_CLASS_BE) {
                    Some("best-effort")
                } else {
                    None
                };
                match class {
                    Some(c) => debug!(class = c, "raised I/O priority"),
                    None => warn!(
                        "failed to set I/O priority: {}",
                        std::io::Error::last_os_error()
                    ),
                }
                class
            });
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxIoHints;

/// The hint implementation for the current platform.
pub fn default_hints() -> Arc<dyn IoHints> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxIoHints::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(NoopIoHints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_noop_hints_still_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noop.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"payload").unwrap();

        let hints = NoopIoHints;
        hints.advise_sequential(&file);
        hints.advise_dont_need(&file, 0, 7);
        hints.elevate_priority();
        hints.sync_barrier(&file).unwrap();
    }

    #[test]
    fn test_default_hints_never_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hinted.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(&[0u8; 4096]).unwrap();

        let hints = default_hints();
        hints.elevate_priority();
        hints.elevate_priority();
        hints.advise_sequential(&file);
        hints.sync_barrier(&file).unwrap();
        hints.advise_dont_need(&file, 1024, 3072);
    }
}

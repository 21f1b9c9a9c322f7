//! Self-locating key trailer
//!
//! ```text
//! ... payload ... [blob: N bytes of UTF-8 envelope text][N as u32 LE]
//! ```

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use lockbox_core::{VaultError, VaultResult};
use lockbox_storage::{DurableFile, DurableOptions};

/// Width of the trailing length field
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Upper bound on a trailer blob; real trailers are a few hundred bytes.
pub const MAX_TRAILER_LEN: u32 = 64 * 1024;

/// A trailer read back from an encrypted file.
#[derive(Debug, Clone)]
pub struct Trailer {
    pub blob: String,
}

impl Trailer {
    /// Bytes the trailer occupies at the end of the file, length field included.
    pub fn total_len(&self) -> u64 {
        (self.blob.len() + LENGTH_FIELD_SIZE) as u64
    }
}

/// Append `blob` and its length to `path`, then flush durably.
pub fn append_trailer(path: &Path, blob: &str, options: DurableOptions) -> VaultResult<u64> {
    let len = u32::try_from(blob.len())
        .ok()
        .filter(|&n| n > 0 && n <= MAX_TRAILER_LEN)
        .ok_or_else(|| VaultError::Crypto(format!("trailer blob of {} bytes", blob.len())))?;

    let mut out = DurableFile::open_append(path, options)?;
    out.write_all(blob.as_bytes())?;
    out.write_all(&len.to_le_bytes())?;
    out.durable_flush()?;
    out.close();

    debug!(path = %path.display(), trailer_len = len, "key trailer appended");
    Ok(u64::from(len) + LENGTH_FIELD_SIZE as u64)
}

/// Read the trailer from the end of `path`.
///
/// A missing or implausible length field is `NotFound`: the file either was
/// never completed or is not an encrypted file.
pub fn read_trailer(path: &Path, options: DurableOptions) -> VaultResult<Trailer> {
    let mut input = DurableFile::open_read(path, options)?;
    let file_len = input.len()?;
    if file_len < LENGTH_FIELD_SIZE as u64 {
        return Err(VaultError::NotFound(format!(
            "key trailer: {} is too short ({file_len} bytes)",
            path.display()
        )));
    }

    input.seek(SeekFrom::End(-(LENGTH_FIELD_SIZE as i64)))?;
    let mut len_bytes = [0u8; LENGTH_FIELD_SIZE];
    input.read_exact(&mut len_bytes)?;
    let blob_len = u32::from_le_bytes(len_bytes);

    if blob_len == 0
        || blob_len > MAX_TRAILER_LEN
        || u64::from(blob_len) + LENGTH_FIELD_SIZE as u64 > file_len
    {
        return Err(VaultError::NotFound(format!(
            "key trailer: invalid length {blob_len} in {}",
            path.display()
        )));
    }

    input.seek(SeekFrom::End(
        -(i64::from(blob_len) + LENGTH_FIELD_SIZE as i64),
    ))?;
    let mut blob = vec![0u8; blob_len as usize];
    input.read_exact(&mut blob)?;
    input.close();

    let blob = String::from_utf8(blob)
        .map_err(|_| VaultError::key_integrity("trailer is not valid text"))?;
    Ok(Trailer { blob })
}

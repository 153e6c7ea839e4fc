//! Raw image write operations.

use crate::HalResult;
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::path::Path;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Options for raw writes.
#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    pub dry_run: bool,
    /// Re-read the written region and compare digests.
    pub verify: bool,
}

impl FlashOptions {
    pub fn new(dry_run: bool, verify: bool) -> Self {
        Self { dry_run, verify }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashProgress {
    pub transferred: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub bytes_written: u64,
    pub sha256: String,
}

/// Trait for writing disk images to raw devices.
pub trait FlashOps {
    /// Stream `image_path` onto `target`, reporting byte progress.
    ///
    /// The target descriptor is closed before this returns.
    fn flash_raw_image(
        &self,
        image_path: &Path,
        target: &Path,
        opts: &FlashOptions,
        progress: &mut dyn FnMut(FlashProgress),
    ) -> HalResult<FlashReport>;
}

/// Copy `reader` into `writer` in fixed chunks, hashing as it goes.
pub fn stream_image(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    length: u64,
    progress: &mut dyn FnMut(FlashProgress),
) -> io::Result<FlashReport> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut transferred = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read])?;
        hasher.update(&buffer[..read]);
        transferred += read as u64;
        progress(FlashProgress {
            transferred,
            length,
        });
    }
    writer.flush()?;
    Ok(FlashReport {
        bytes_written: transferred,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

/// SHA-256 of the first `len` bytes of `reader`.
pub fn hash_prefix(reader: &mut dyn Read, len: u64) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut limited = reader.take(len);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = limited.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

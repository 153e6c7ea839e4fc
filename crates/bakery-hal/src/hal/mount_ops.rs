//! Mounting and unmounting card partitions.

use crate::{Drive, HalResult};
use std::path::Path;

pub trait MountOps {
    /// Mount `device` (a partition or a `/dev/mapper` node) on `target`.
    ///
    /// `fstype` of `None` lets the kernel probe. In dry-run only the intent
    /// is logged.
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()>;

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()>;

    /// Unmount every partition of a drive with the OS-native tool.
    ///
    /// A drive with nothing mounted is not an error.
    fn unmount_disk(&self, drive: &Drive, dry_run: bool) -> HalResult<()>;
}

/// Extra `-o` data passed to the mount, e.g. `umask=000`.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub options: Option<String>,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }
}

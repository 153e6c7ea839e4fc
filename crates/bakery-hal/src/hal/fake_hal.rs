//! Fake HAL implementation for testing.
//!
//! This implementation records all operations without executing them,
//! allowing for CI-safe testing without root privileges or real hardware.
//! Drive snapshots, readable files and failures are scripted up front.

use super::flash_ops::stream_image;
use super::{
    DriveOps, FlashOps, FlashOptions, FlashProgress, FlashReport, MountOps, MountOptions,
    PartitionMapOps, ProbeOps, SystemOps,
};
use crate::{Drive, HalError, HalResult, PartitionMap};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ListDrives,
    QueryDrive { device: String },
    Mount {
        device: PathBuf,
        target: PathBuf,
        fstype: Option<String>,
    },
    Unmount { target: PathBuf },
    UnmountDisk { device: String },
    PartitionToolCheck,
    AddPartitionMaps { device: String },
    DeletePartitionMaps { device: String },
    FlashImage { image: PathBuf, target: PathBuf },
    Sync,
    Pause { duration: Duration },
}

/// Points at which a scripted failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    UnmountDisk,
    Mount,
    Unmount,
    AddPartitionMaps,
    DeletePartitionMaps,
    Flash,
}

#[derive(Debug, Clone)]
struct FakeHalState {
    operations: Vec<Operation>,
    mounted_paths: HashSet<PathBuf>,
    drives: Vec<Drive>,
    /// Per-device snapshot queues; the last snapshot repeats once the queue drains.
    snapshots: HashMap<String, VecDeque<Option<Drive>>>,
    readable: HashSet<PathBuf>,
    failures: HashSet<FailPoint>,
    partition_tool: bool,
    partition_maps: Vec<PartitionMap>,
    elevated: bool,
}

impl Default for FakeHalState {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            mounted_paths: HashSet::new(),
            drives: Vec::new(),
            snapshots: HashMap::new(),
            readable: HashSet::new(),
            failures: HashSet::new(),
            partition_tool: true,
            partition_maps: vec![PartitionMap {
                name: "loop0p1".to_string(),
                size_sectors: 524288,
            }],
            elevated: true,
        }
    }
}

/// Fake HAL implementation that records operations without executing them.
///
/// Clones share state, so a test can keep a handle while the code under test
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeHalState> {
        // A panicking test thread must not hide the recorded operations.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drives returned by `list_drives`.
    pub fn with_drives(self, drives: Vec<Drive>) -> Self {
        self.lock().drives = drives;
        self
    }

    /// Successive snapshots returned by `drive_by_device` for one device.
    pub fn script_drive(self, device: &str, snapshots: Vec<Drive>) -> Self {
        self.script_presence(device, snapshots.into_iter().map(Some).collect())
    }

    /// Like [`FakeHal::script_drive`], with `None` for polls where the host
    /// does not report the device at all.
    pub fn script_presence(self, device: &str, snapshots: Vec<Option<Drive>>) -> Self {
        self.lock()
            .snapshots
            .insert(device.to_string(), snapshots.into_iter().collect());
        self
    }

    /// Make `path` readable as far as `file_readable` is concerned.
    pub fn mark_readable(self, path: impl Into<PathBuf>) -> Self {
        self.lock().readable.insert(path.into());
        self
    }

    pub fn fail_on(self, point: FailPoint) -> Self {
        self.lock().failures.insert(point);
        self
    }

    pub fn without_partition_tool(self) -> Self {
        self.lock().partition_tool = false;
        self
    }

    pub fn with_partition_maps(self, maps: Vec<PartitionMap>) -> Self {
        self.lock().partition_maps = maps;
        self
    }

    pub fn with_elevation(self, elevated: bool) -> Self {
        self.lock().elevated = elevated;
        self
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.lock().operations.iter().any(check)
    }

    /// Number of times the code under test waited between polls.
    pub fn pause_count(&self) -> usize {
        self.lock()
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::Pause { .. }))
            .count()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.lock().mounted_paths.contains(path)
    }

    /// Clear all recorded operations.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.operations.clear();
        state.mounted_paths.clear();
    }

    fn record_operation(&self, op: Operation) {
        self.lock().operations.push(op);
    }

    fn check_failure(&self, point: FailPoint, program: &str) -> HalResult<()> {
        if self.lock().failures.contains(&point) {
            return Err(HalError::CommandFailed {
                program: program.to_string(),
                code: Some(1),
                stderr: format!("fake {program} failure"),
            });
        }
        Ok(())
    }
}

impl DriveOps for FakeHal {
    fn list_drives(&self) -> HalResult<Vec<Drive>> {
        self.record_operation(Operation::ListDrives);
        Ok(self.lock().drives.clone())
    }

    fn drive_by_device(&self, device: &str) -> HalResult<Option<Drive>> {
        self.record_operation(Operation::QueryDrive {
            device: device.to_string(),
        });
        let mut state = self.lock();
        if let Some(queue) = state.snapshots.get_mut(device) {
            let snapshot = if queue.len() > 1 {
                queue.pop_front().flatten()
            } else {
                queue.front().cloned().flatten()
            };
            return Ok(snapshot);
        }
        Ok(state.drives.iter().find(|d| d.device == device).cloned())
    }
}

impl MountOps for FakeHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        _options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()> {
        if dry_run {
            log::info!(
                "FAKE HAL DRY RUN: mount {} -> {}",
                device.display(),
                target.display()
            );
            return Ok(());
        }

        log::info!(
            "FAKE HAL: mount {} -> {} (type: {:?})",
            device.display(),
            target.display(),
            fstype
        );

        self.record_operation(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.map(String::from),
        });
        self.check_failure(FailPoint::Mount, "mount")?;
        self.lock().mounted_paths.insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("FAKE HAL DRY RUN: unmount {}", target.display());
            return Ok(());
        }

        log::info!("FAKE HAL: unmount {}", target.display());

        self.record_operation(Operation::Unmount {
            target: target.to_path_buf(),
        });
        self.check_failure(FailPoint::Unmount, "umount")?;
        self.lock().mounted_paths.remove(target);
        Ok(())
    }

    fn unmount_disk(&self, drive: &Drive, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("FAKE HAL DRY RUN: unmount disk {}", drive.device);
            return Ok(());
        }
        self.record_operation(Operation::UnmountDisk {
            device: drive.device.clone(),
        });
        self.check_failure(FailPoint::UnmountDisk, "umount")
    }
}

impl PartitionMapOps for FakeHal {
    fn partition_tool_installed(&self) -> HalResult<bool> {
        self.record_operation(Operation::PartitionToolCheck);
        Ok(self.lock().partition_tool)
    }

    fn add_partition_maps(&self, device: &str) -> HalResult<Vec<PartitionMap>> {
        self.record_operation(Operation::AddPartitionMaps {
            device: device.to_string(),
        });
        self.check_failure(FailPoint::AddPartitionMaps, "kpartx")?;
        Ok(self.lock().partition_maps.clone())
    }

    fn delete_partition_maps(&self, device: &str) -> HalResult<()> {
        self.record_operation(Operation::DeletePartitionMaps {
            device: device.to_string(),
        });
        self.check_failure(FailPoint::DeletePartitionMaps, "kpartx")
    }
}

impl FlashOps for FakeHal {
    fn flash_raw_image(
        &self,
        image_path: &Path,
        target: &Path,
        opts: &FlashOptions,
        progress: &mut dyn FnMut(FlashProgress),
    ) -> HalResult<FlashReport> {
        if opts.dry_run {
            log::info!(
                "FAKE HAL DRY RUN: flash {} -> {}",
                image_path.display(),
                target.display()
            );
            return Ok(FlashReport {
                bytes_written: 0,
                sha256: String::new(),
            });
        }

        self.record_operation(Operation::FlashImage {
            image: image_path.to_path_buf(),
            target: target.to_path_buf(),
        });
        self.check_failure(FailPoint::Flash, "write")?;

        // Hash the image so progress and digests look like a real write.
        let mut input = fs::File::open(image_path)?;
        let length = input.metadata()?.len();
        Ok(stream_image(&mut input, &mut io::sink(), length, progress)?)
    }
}

impl ProbeOps for FakeHal {
    fn file_readable(&self, path: &Path) -> bool {
        self.lock().readable.contains(path) || path.is_file()
    }
}

impl SystemOps for FakeHal {
    fn sync(&self) -> HalResult<()> {
        self.record_operation(Operation::Sync);
        Ok(())
    }

    fn pause(&self, duration: Duration) {
        self.record_operation(Operation::Pause { duration });
    }

    fn is_elevated(&self) -> bool {
        self.lock().elevated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_snapshots_drain_then_repeat_last() {
        let hal = FakeHal::new().script_drive(
            "/dev/disk2",
            vec![
                Drive::new("/dev/disk2", 10),
                Drive::new("/dev/disk2", 10).with_mountpoints(["/Volumes/boot"]),
            ],
        );

        let first = hal.drive_by_device("/dev/disk2").unwrap().unwrap();
        assert!(first.mountpoints.is_empty());
        for _ in 0..3 {
            let next = hal.drive_by_device("/dev/disk2").unwrap().unwrap();
            assert_eq!(next.mountpoints, vec![PathBuf::from("/Volumes/boot")]);
        }
    }

    #[test]
    fn failures_are_recorded_before_they_fire() {
        let hal = FakeHal::new().fail_on(FailPoint::Mount);
        let err = hal
            .mount_device(
                Path::new("/dev/mapper/loop0p1"),
                Path::new("/tmp/boot"),
                Some("vfat"),
                MountOptions::new(),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, HalError::CommandFailed { .. }));
        assert!(hal.has_operation(|op| matches!(op, Operation::Mount { .. })));
        assert!(!hal.is_mounted(Path::new("/tmp/boot")));
    }

    #[test]
    fn pause_does_not_sleep() {
        let hal = FakeHal::new();
        let start = std::time::Instant::now();
        hal.pause(Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(hal.pause_count(), 1);
    }
}

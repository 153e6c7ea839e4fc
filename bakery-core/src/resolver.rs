//! Finding the card's boot partition after a raw write.
//!
//! The host is polled for the drive's mountpoints until one of them carries
//! the boot marker. On Linux an unmounted card is mapped with kpartx and its
//! first partition mounted by hand once the polling budget runs out.

use crate::config::BakeryConfig;
use crate::progress::Progress;
use bakery_error::{BakeryError, BakeryResult};
use bakery_hal::{Drive, MountOptions, SystemHal};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// macOS: the OS always remounts; exactly one mountpoint expected.
    Remote,
    /// Linux and the BSDs: several partitions may mount, or none at all.
    Unix,
}

impl Strategy {
    pub fn for_host() -> Self {
        if cfg!(target_os = "macos") {
            Strategy::Remote
        } else {
            Strategy::Unix
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    pub mountpoint: PathBuf,
    /// The partition was mapped and mounted by us and must be cleaned up.
    pub manual: bool,
}

pub struct Resolver<'a> {
    hal: &'a dyn SystemHal,
    config: &'a BakeryConfig,
    progress: &'a Progress,
    dry_run: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(
        hal: &'a dyn SystemHal,
        config: &'a BakeryConfig,
        progress: &'a Progress,
        dry_run: bool,
    ) -> Self {
        Self {
            hal,
            config,
            progress,
            dry_run,
        }
    }

    pub fn resolve(&self, drive: &Drive, strategy: Strategy) -> BakeryResult<ResolvedMount> {
        self.progress.status("Waiting for SD card to remount...");
        match strategy {
            Strategy::Remote => self.poll_remote(drive),
            Strategy::Unix => self.poll_unix(drive),
        }
    }

    /// Fresh snapshot of `drive`. A drive the host stopped reporting (it
    /// vanishes briefly while the kernel re-reads the partition table) counts
    /// as having nothing mounted.
    fn refetch(&self, drive: &Drive) -> BakeryResult<Drive> {
        match self.hal.drive_by_device(&drive.device)? {
            Some(current) => Ok(current),
            None => {
                log::debug!("{} is not reported right now", drive.device);
                Ok(Drive::new(drive.device.clone(), drive.size))
            }
        }
    }

    fn has_marker(&self, mountpoint: &Path) -> bool {
        self.hal
            .file_readable(&mountpoint.join(&self.config.boot_marker))
    }

    fn auto(mountpoint: &Path) -> ResolvedMount {
        log::info!("✅ Boot partition found at {}", mountpoint.display());
        ResolvedMount {
            mountpoint: mountpoint.to_path_buf(),
            manual: false,
        }
    }

    fn poll_remote(&self, drive: &Drive) -> BakeryResult<ResolvedMount> {
        let mut mounted = false;
        for attempt in 1..=self.config.remote_attempts {
            if attempt > 1 {
                self.hal.pause(self.config.poll_interval());
            }
            let current = self.refetch(drive)?;
            log::debug!(
                "Remount poll {attempt}/{}: {:?}",
                self.config.remote_attempts,
                current.mountpoints
            );
            match current.mountpoints.as_slice() {
                [] => mounted = false,
                [only] => {
                    if self.has_marker(only) {
                        return Ok(Self::auto(only));
                    }
                    mounted = true;
                }
                many => {
                    return Err(BakeryError::AmbiguousMountpoints {
                        device: drive.device.clone(),
                        detail: format!("There is more than one mountpoint. Mountpoints: {many:?}."),
                    })
                }
            }
        }
        Err(BakeryError::RemountTimeout {
            device: drive.device.clone(),
            mounted,
        })
    }

    fn poll_unix(&self, drive: &Drive) -> BakeryResult<ResolvedMount> {
        let mut mounted = false;
        for attempt in 1..=self.config.unix_attempts {
            if attempt > 1 {
                self.hal.pause(self.config.poll_interval());
            }
            let current = self.refetch(drive)?;
            if current.mountpoints.is_empty() {
                mounted = false;
                continue;
            }
            if let Some(found) = current.mountpoints.iter().find(|mp| self.has_marker(mp)) {
                return Ok(Self::auto(found));
            }
            mounted = true;
        }

        if mounted {
            return Err(BakeryError::AmbiguousMountpoints {
                device: drive.device.clone(),
                detail: format!(
                    "The device remounted, but {} could not be read.",
                    self.config.boot_marker
                ),
            });
        }
        self.manual_mount(drive)
    }

    fn manual_mount(&self, drive: &Drive) -> BakeryResult<ResolvedMount> {
        self.progress.status("Mounting SD card manually...");
        if !self.hal.partition_tool_installed()? {
            return Err(BakeryError::MissingPartitionTool);
        }

        let maps = self
            .hal
            .add_partition_maps(&drive.device)
            .map_err(|e| BakeryError::PartitionMapFailure {
                device: drive.device.clone(),
                reason: e.to_string(),
                teardown: None,
            })?;
        let Some(boot) = maps.first() else {
            return Err(self.unwind(drive, None, "no partition mappings were created".to_string()));
        };

        let mountpoint = match tempfile::Builder::new().prefix("pibakeryboot").tempdir() {
            Ok(dir) => dir.into_path(),
            Err(err) => return Err(self.unwind(drive, None, err.to_string())),
        };

        if let Err(err) = self.hal.mount_device(
            &boot.mapper_path(),
            &mountpoint,
            Some("vfat"),
            MountOptions::new(),
            self.dry_run,
        ) {
            return Err(self.unwind(drive, Some(&mountpoint), err.to_string()));
        }

        log::info!(
            "✅ Mounted {} at {}",
            boot.mapper_path().display(),
            mountpoint.display()
        );
        Ok(ResolvedMount {
            mountpoint,
            manual: true,
        })
    }

    /// Best-effort removal of what a failed manual mount left behind.
    fn unwind(&self, drive: &Drive, mountpoint: Option<&Path>, reason: String) -> BakeryError {
        log::error!("❌ Manual mount of {} failed: {reason}", drive.device);
        let mut problems = Vec::new();
        if let Some(dir) = mountpoint {
            if let Err(err) = std::fs::remove_dir(dir) {
                log::warn!("⚠️ Could not remove {}: {err}", dir.display());
                problems.push(format!("removing {}: {err}", dir.display()));
            }
        }
        if let Err(err) = self.hal.delete_partition_maps(&drive.device) {
            log::error!("❌ Removing partition mappings also failed: {err}");
            problems.push(err.to_string());
        }
        BakeryError::PartitionMapFailure {
            device: drive.device.clone(),
            reason,
            teardown: (!problems.is_empty()).then(|| problems.join("; ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bakery_hal::{FailPoint, FakeHal, Operation};

    const DEV: &str = "/dev/sdz";

    fn card() -> Drive {
        Drive::new(DEV, 8 << 30)
    }

    fn mounted(paths: &[&str]) -> Drive {
        card().with_mountpoints(paths.iter().copied())
    }

    fn resolve(hal: &FakeHal, strategy: Strategy) -> BakeryResult<ResolvedMount> {
        let config = BakeryConfig::default();
        let progress = Progress::silent();
        Resolver::new(hal, &config, &progress, false).resolve(&card(), strategy)
    }

    #[test]
    fn remote_resolves_on_the_twelfth_poll() {
        let mut snapshots = vec![card(); 11];
        snapshots.push(mounted(&["/Volumes/boot"]));
        let hal = FakeHal::new()
            .script_drive(DEV, snapshots)
            .mark_readable("/Volumes/boot/bootcode.bin");

        let found = resolve(&hal, Strategy::Remote).unwrap();
        assert_eq!(found.mountpoint, PathBuf::from("/Volumes/boot"));
        assert!(!found.manual);
        assert_eq!(hal.pause_count(), 11);
    }

    #[test]
    fn remote_times_out_after_twelve_polls() {
        let hal = FakeHal::new().script_drive(DEV, vec![card(); 13]);
        let err = resolve(&hal, Strategy::Remote).unwrap_err();
        assert!(matches!(err, BakeryError::RemountTimeout { mounted: false, .. }));
        assert_eq!(err.code(), "DID_NOT_REMOUNT");
        let polls = hal
            .operations()
            .iter()
            .filter(|op| matches!(op, Operation::QueryDrive { .. }))
            .count();
        assert_eq!(polls, 12);
    }

    #[test]
    fn remote_mounted_without_marker_says_so() {
        let hal = FakeHal::new().script_drive(DEV, vec![mounted(&["/Volumes/NO NAME"])]);
        let err = resolve(&hal, Strategy::Remote).unwrap_err();
        assert!(matches!(err, BakeryError::RemountTimeout { mounted: true, .. }));
    }

    #[test]
    fn remote_rejects_several_mountpoints() {
        let hal = FakeHal::new().script_drive(
            DEV,
            vec![card(), mounted(&["/Volumes/boot", "/Volumes/rootfs"])],
        );
        let err = resolve(&hal, Strategy::Remote).unwrap_err();
        assert_eq!(err.code(), "TOO_MANY_MOUNTPOINTS");
    }

    #[test]
    fn remote_one_mountpoint_then_two_is_ambiguous() {
        let hal = FakeHal::new().script_drive(
            DEV,
            vec![
                mounted(&["/Volumes/NO NAME"]),
                mounted(&["/Volumes/NO NAME", "/Volumes/rootfs"]),
            ],
        );
        let err = resolve(&hal, Strategy::Remote).unwrap_err();
        assert_eq!(err.code(), "TOO_MANY_MOUNTPOINTS");
        assert_eq!(hal.pause_count(), 1);
    }

    #[test]
    fn remote_keeps_polling_while_the_drive_is_missing() {
        let hal = FakeHal::new()
            .script_presence(DEV, vec![None, None, Some(mounted(&["/Volumes/boot"]))])
            .mark_readable("/Volumes/boot/bootcode.bin");
        let found = resolve(&hal, Strategy::Remote).unwrap();
        assert_eq!(found.mountpoint, PathBuf::from("/Volumes/boot"));
        assert_eq!(hal.pause_count(), 2);
    }

    #[test]
    fn remote_drive_that_never_returns_did_not_remount() {
        let hal = FakeHal::new()
            .script_presence(DEV, vec![Some(mounted(&["/Volumes/NO NAME"])), None]);
        let err = resolve(&hal, Strategy::Remote).unwrap_err();
        assert!(matches!(err, BakeryError::RemountTimeout { mounted: false, .. }));
    }

    #[test]
    fn unix_checks_every_mountpoint() {
        let hal = FakeHal::new()
            .script_drive(DEV, vec![mounted(&["/media/pi/rootfs", "/media/pi/boot"])])
            .mark_readable("/media/pi/boot/bootcode.bin");
        let found = resolve(&hal, Strategy::Unix).unwrap();
        assert_eq!(found.mountpoint, PathBuf::from("/media/pi/boot"));
        assert!(!hal.has_operation(|op| matches!(op, Operation::PartitionToolCheck)));
    }

    #[test]
    fn unix_falls_back_to_a_manual_mount() {
        let hal = FakeHal::new().script_drive(DEV, vec![card()]);
        let found = resolve(&hal, Strategy::Unix).unwrap();
        assert!(found.manual);
        assert!(hal.is_mounted(&found.mountpoint));
        assert_eq!(hal.pause_count(), 2);
        assert!(hal.has_operation(|op| matches!(
            op,
            Operation::Mount { device, fstype: Some(fs), .. }
                if device == Path::new("/dev/mapper/loop0p1") && fs == "vfat"
        )));
        std::fs::remove_dir(&found.mountpoint).unwrap();
    }

    #[test]
    fn unix_without_kpartx_fails() {
        let hal = FakeHal::new()
            .script_drive(DEV, vec![card()])
            .without_partition_tool();
        let err = resolve(&hal, Strategy::Unix).unwrap_err();
        assert_eq!(err.code(), "MISSING_KPARTX");
    }

    #[test]
    fn unix_mounted_without_marker_does_not_map() {
        let hal = FakeHal::new().script_drive(DEV, vec![mounted(&["/media/pi/rootfs"])]);
        let err = resolve(&hal, Strategy::Unix).unwrap_err();
        assert_eq!(err.code(), "TOO_MANY_MOUNTPOINTS");
        assert!(err.to_string().contains("bootcode.bin could not be read"));
        assert!(!hal.has_operation(|op| matches!(op, Operation::AddPartitionMaps { .. })));
    }

    #[test]
    fn failed_manual_mount_tears_down_and_reports_both_errors() {
        let hal = FakeHal::new()
            .script_drive(DEV, vec![card()])
            .fail_on(FailPoint::Mount)
            .fail_on(FailPoint::DeletePartitionMaps);
        let err = resolve(&hal, Strategy::Unix).unwrap_err();
        match &err {
            BakeryError::PartitionMapFailure {
                reason, teardown, ..
            } => {
                assert!(reason.contains("mount"));
                assert!(teardown.as_deref().unwrap_or_default().contains("kpartx"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(hal.has_operation(|op| matches!(op, Operation::DeletePartitionMaps { .. })));
    }

    #[test]
    fn failed_manual_mount_removes_its_mountpoint() {
        let hal = FakeHal::new()
            .script_drive(DEV, vec![card()])
            .fail_on(FailPoint::Mount);
        let err = resolve(&hal, Strategy::Unix).unwrap_err();
        assert!(matches!(err, BakeryError::PartitionMapFailure { teardown: None, .. }));
        let target = hal.operations().into_iter().find_map(|op| match op {
            Operation::Mount { target, .. } => Some(target),
            _ => None,
        });
        assert!(target.is_some_and(|t| !t.exists()));
    }
}

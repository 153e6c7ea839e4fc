//! Host HAL implementation using real system calls and tools.

use super::flash_ops::{hash_prefix, stream_image};
use super::partition_map_ops::parse_kpartx_add;
use super::{
    DriveOps, FlashOps, FlashOptions, FlashProgress, FlashReport, MountOps, MountOptions,
    PartitionMapOps, ProbeOps, SystemOps,
};
use crate::{Drive, HalError, HalResult, PartitionMap};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Real HAL implementation for the machine we are running on.
#[derive(Debug, Clone, Default)]
pub struct HostHal;

impl HostHal {
    pub fn new() -> Self {
        Self
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SYNC_TIMEOUT: Duration = Duration::from_secs(60);
#[cfg_attr(target_os = "linux", allow(dead_code))]
const UNMOUNT_TIMEOUT: Duration = Duration::from_secs(60);
const KPARTX_TIMEOUT: Duration = Duration::from_secs(30);

fn map_command_err(program: &str, err: std::io::Error) -> HalError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return HalError::CommandNotFound(program.to_string());
    }
    HalError::Io(err)
}

fn output_failed(program: &str, output: &Output) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn output_with_timeout(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<Output> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| map_command_err(program, e))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    // Drain pipes concurrently to avoid deadlocks on large output.
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout.take() {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr.take() {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let status = match child.wait_timeout(timeout).map_err(HalError::Io)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            return Err(HalError::CommandTimeout {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

fn status_with_timeout(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<()> {
    let output = output_with_timeout(program, cmd, timeout)?;
    if !output.status.success() {
        return Err(output_failed(program, &output));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn map_nix_err(err: nix::errno::Errno) -> HalError {
    use nix::errno::Errno;
    match err {
        Errno::EBUSY => HalError::DiskBusy,
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        other => HalError::Nix(other),
    }
}

#[cfg(target_os = "linux")]
fn linux_drives() -> HalResult<Vec<Drive>> {
    use crate::procfs::mountinfo::{
        is_device_or_partition, mountpoints_for_device, parse_mountinfo, root_mount_source,
    };
    use crate::sysfs::block::scan_block_devices;

    let mountinfo = fs::read_to_string("/proc/self/mountinfo")?;
    let entries = parse_mountinfo(&mountinfo);
    let root_source = root_mount_source(&entries).unwrap_or_default().to_string();

    Ok(scan_block_devices()?
        .into_iter()
        .map(|dev| {
            let device = dev.dev_path.to_string_lossy().to_string();
            let hosts_root = is_device_or_partition(&root_source, &device);
            Drive {
                mountpoints: mountpoints_for_device(&entries, &dev.dev_path),
                raw: dev.dev_path.clone(),
                description: dev.description(),
                size: dev.size_bytes,
                system: hosts_root || !dev.removable,
                protected: dev.read_only,
                device,
            }
        })
        .collect())
}

/// Mountpoints of `device`'s partitions from BSD-style `mount` output
/// (`/dev/disk2s1 on /Volumes/boot (msdos, local, nodev)`).
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_bsd_mount_output(output: &str, device: &str) -> Vec<std::path::PathBuf> {
    output
        .lines()
        .filter_map(|line| {
            let (source, rest) = line.split_once(" on ")?;
            let partition = source.strip_prefix(device)?;
            if !partition.is_empty() && !partition.starts_with('s') {
                return None;
            }
            let (mountpoint, _) = rest.rsplit_once(" (")?;
            Some(std::path::PathBuf::from(mountpoint))
        })
        .collect()
}

#[cfg(target_os = "macos")]
fn diskutil(args: &[&str]) -> HalResult<Output> {
    let mut cmd = Command::new("/usr/sbin/diskutil");
    cmd.args(args);
    output_with_timeout("diskutil", &mut cmd, PROBE_TIMEOUT)
}

#[cfg(target_os = "macos")]
fn bsd_mount_table() -> HalResult<String> {
    let mut cmd = Command::new("/sbin/mount");
    let output = output_with_timeout("mount", &mut cmd, PROBE_TIMEOUT)?;
    if !output.status.success() {
        return Err(output_failed("mount", &output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(target_os = "macos")]
fn macos_drive(device: &str, mount_table: &str) -> HalResult<Option<Drive>> {
    use crate::diskutil::parse_disk_info;

    let output = diskutil(&["info", device])?;
    if !output.status.success() {
        // Gone, e.g. while the card re-enumerates after a write.
        log::debug!("diskutil does not know {device}");
        return Ok(None);
    }
    let info = parse_disk_info(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| HalError::Parse(format!("diskutil info {device} reported no size")))?;
    Ok(Some(info.into_drive(
        device,
        parse_bsd_mount_output(mount_table, device),
    )))
}

impl DriveOps for HostHal {
    fn list_drives(&self) -> HalResult<Vec<Drive>> {
        #[cfg(target_os = "linux")]
        {
            linux_drives()
        }
        #[cfg(target_os = "macos")]
        {
            let output = diskutil(&["list"])?;
            if !output.status.success() {
                return Err(output_failed("diskutil", &output));
            }
            let mount_table = bsd_mount_table()?;
            let mut drives = Vec::new();
            for device in crate::diskutil::parse_disk_list(&String::from_utf8_lossy(&output.stdout)) {
                drives.extend(macos_drive(&device, &mount_table)?);
            }
            Ok(drives)
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            Err(HalError::Unsupported("drive enumeration".to_string()))
        }
    }

    #[cfg(target_os = "macos")]
    fn drive_by_device(&self, device: &str) -> HalResult<Option<Drive>> {
        macos_drive(device, &bsd_mount_table()?)
    }
}

impl MountOps for HostHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()> {
        if dry_run {
            log::info!(
                "DRY RUN: mount {} -> {}",
                device.display(),
                target.display()
            );
            return Ok(());
        }

        #[cfg(target_os = "linux")]
        {
            let flags = nix::mount::MsFlags::empty();
            let data = options.options.as_deref();
            nix::mount::mount(Some(device), target, fstype, flags, data).map_err(map_nix_err)?;
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (fstype, options);
            Err(HalError::Unsupported(format!(
                "manual mount of {}",
                device.display()
            )))
        }
    }

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("DRY RUN: unmount {}", target.display());
            return Ok(());
        }

        #[cfg(target_os = "linux")]
        {
            nix::mount::umount2(target, nix::mount::MntFlags::empty()).map_err(map_nix_err)?;
            Ok(())
        }
        #[cfg(all(unix, not(target_os = "linux")))]
        {
            let mut cmd = Command::new("umount");
            cmd.arg(target);
            status_with_timeout("umount", &mut cmd, UNMOUNT_TIMEOUT)
        }
        #[cfg(not(unix))]
        {
            Err(HalError::Unsupported(format!("unmount {}", target.display())))
        }
    }

    fn unmount_disk(&self, drive: &Drive, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("DRY RUN: unmount disk {}", drive.device);
            return Ok(());
        }

        #[cfg(target_os = "linux")]
        {
            use crate::procfs::mountinfo::{mountpoints_for_device, parse_mountinfo};
            let mountinfo = fs::read_to_string("/proc/self/mountinfo")?;
            let entries = parse_mountinfo(&mountinfo);
            for mountpoint in mountpoints_for_device(&entries, Path::new(&drive.device)) {
                log::info!("⏏️ Unmounting {}", mountpoint.display());
                match nix::mount::umount2(&mountpoint, nix::mount::MntFlags::empty()) {
                    Ok(()) => {}
                    // Already gone.
                    Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
                    Err(err) => return Err(map_nix_err(err)),
                }
            }
            Ok(())
        }
        #[cfg(target_os = "macos")]
        {
            let mut cmd = Command::new("/usr/sbin/diskutil");
            cmd.args(["unmountDisk", "force", &drive.device]);
            status_with_timeout("diskutil", &mut cmd, UNMOUNT_TIMEOUT)
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            // Raw writes to a physical drive do not need the volumes dismounted first.
            Ok(())
        }
    }
}

impl PartitionMapOps for HostHal {
    fn partition_tool_installed(&self) -> HalResult<bool> {
        let mut cmd = Command::new("which");
        cmd.arg("kpartx");
        match output_with_timeout("which", &mut cmd, PROBE_TIMEOUT) {
            Ok(output) => Ok(output.status.success()),
            Err(HalError::CommandNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn add_partition_maps(&self, device: &str) -> HalResult<Vec<PartitionMap>> {
        let mut cmd = Command::new("kpartx");
        cmd.args(["-asv", device]);
        let output = output_with_timeout("kpartx", &mut cmd, KPARTX_TIMEOUT)?;
        parse_kpartx_add(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
    }

    fn delete_partition_maps(&self, device: &str) -> HalResult<()> {
        let mut cmd = Command::new("kpartx");
        cmd.args(["-d", device]);
        status_with_timeout("kpartx", &mut cmd, KPARTX_TIMEOUT)
    }
}

impl FlashOps for HostHal {
    fn flash_raw_image(
        &self,
        image_path: &Path,
        target: &Path,
        opts: &FlashOptions,
        progress: &mut dyn FnMut(FlashProgress),
    ) -> HalResult<FlashReport> {
        if opts.dry_run {
            log::info!(
                "DRY RUN: flash {} -> {}",
                image_path.display(),
                target.display()
            );
            return Ok(FlashReport {
                bytes_written: 0,
                sha256: String::new(),
            });
        }

        log::info!(
            "💾 Flashing image {} -> {}",
            image_path.display(),
            target.display()
        );

        let mut out = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(target)?;
        // Regular files stand in for devices in tests; start them empty.
        if out.metadata()?.is_file() {
            out.set_len(0)?;
        }

        let mut input = fs::File::open(image_path)?;
        let length = input.metadata()?.len();
        let report = stream_image(&mut input, &mut out, length, progress)?;
        out.sync_all().ok();
        drop(out);

        if opts.verify {
            let mut written = fs::File::open(target)?;
            let digest = hash_prefix(&mut written, report.bytes_written)?;
            if digest != report.sha256 {
                return Err(HalError::ValidationFailed(format!(
                    "{} does not match {} after writing",
                    target.display(),
                    image_path.display()
                )));
            }
        }

        Ok(report)
    }
}

impl ProbeOps for HostHal {
    fn file_readable(&self, path: &Path) -> bool {
        fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
    }
}

impl SystemOps for HostHal {
    fn sync(&self) -> HalResult<()> {
        #[cfg(unix)]
        {
            let mut cmd = Command::new("sync");
            status_with_timeout("sync", &mut cmd, SYNC_TIMEOUT)
        }
        #[cfg(not(unix))]
        {
            let _ = SYNC_TIMEOUT;
            Ok(())
        }
    }

    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn is_elevated(&self) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: geteuid has no preconditions and cannot fail.
            unsafe { libc::geteuid() == 0 }
        }
        #[cfg(not(unix))]
        {
            let mut cmd = Command::new("net");
            cmd.arg("session");
            status_with_timeout("net", &mut cmd, PROBE_TIMEOUT).is_ok()
        }
    }
}

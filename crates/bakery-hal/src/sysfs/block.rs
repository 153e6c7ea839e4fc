//! Block device discovery through sysfs.

use bakery_error::HalResult;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub name: String,
    pub dev_path: PathBuf,
    pub size_bytes: u64,
    pub vendor: Option<String>,
    pub model: Option<String>,
    /// Media the user can take out: the kernel's removable flag, SD cards in
    /// built-in readers, and anything behind a USB bridge.
    pub removable: bool,
    pub read_only: bool,
}

impl BlockDevice {
    pub fn description(&self) -> String {
        let parts: Vec<&str> = [self.vendor.as_deref(), self.model.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if parts.is_empty() {
            self.name.clone()
        } else {
            parts.join(" ")
        }
    }
}

/// Reads the block device size from `<dev>/size`, expressed in 512-byte sectors.
pub fn block_device_size_bytes(sys_block_dev_dir: &Path) -> Option<u64> {
    let sectors: u64 = read_trimmed(sys_block_dev_dir.join("size"))?.parse().ok()?;
    Some(sectors.saturating_mul(512))
}

pub fn scan_block_devices() -> HalResult<Vec<BlockDevice>> {
    scan_block_devices_in(Path::new("/sys/block"))
}

pub fn scan_block_devices_in(sys_block_root: &Path) -> HalResult<Vec<BlockDevice>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(sys_block_root)?.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if should_skip_block_device(&name) {
            continue;
        }
        let sysfs_path = sys_block_root.join(&name);
        let size_bytes = match block_device_size_bytes(&sysfs_path) {
            Some(v) if v > 0 => v,
            _ => continue,
        };

        out.push(BlockDevice {
            dev_path: PathBuf::from("/dev").join(&name),
            size_bytes,
            vendor: read_trimmed(sysfs_path.join("device/vendor")),
            model: read_trimmed(sysfs_path.join("device/model")),
            removable: read_flag(sysfs_path.join("removable"))
                || is_sd_card(&sysfs_path, &name)
                || on_usb_bus(&sysfs_path),
            read_only: read_flag(sysfs_path.join("ro")),
            name,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

fn read_trimmed(path: PathBuf) -> Option<String> {
    let value = fs::read_to_string(path).ok()?.trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn read_flag(path: PathBuf) -> bool {
    read_trimmed(path).as_deref() == Some("1")
}

/// Built-in MMC readers report `removable=0`; the card type tells SD media
/// apart from soldered eMMC.
fn is_sd_card(sysfs_path: &Path, name: &str) -> bool {
    name.starts_with("mmcblk") && read_trimmed(sysfs_path.join("device/type")).as_deref() == Some("SD")
}

fn on_usb_bus(sysfs_path: &Path) -> bool {
    fs::canonicalize(sysfs_path)
        .map(|real| {
            real.components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with("usb"))
        })
        .unwrap_or(false)
}

fn should_skip_block_device(name: &str) -> bool {
    name.starts_with("loop")
        || name.starts_with("ram")
        || name.starts_with("zram")
        || name.starts_with("dm-")
        || name.starts_with("md")
        || name.starts_with("sr")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_device(root: &Path, name: &str, sectors: &str, removable: &str) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("device")).unwrap();
        fs::write(dir.join("size"), sectors).unwrap();
        fs::write(dir.join("removable"), removable).unwrap();
    }

    #[test]
    fn scan_skips_virtual_devices_and_reads_flags() {
        let tmp = tempdir().unwrap();
        fake_device(tmp.path(), "sdb", "16\n", "1\n");
        fake_device(tmp.path(), "sda", "8\n", "0\n");
        fake_device(tmp.path(), "loop0", "8\n", "0\n");
        fs::write(tmp.path().join("sdb/device/model"), "SD Card Reader  \n").unwrap();

        let disks = scan_block_devices_in(tmp.path()).unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].name, "sda");
        assert!(!disks[0].removable);
        assert_eq!(disks[1].size_bytes, 8192);
        assert!(disks[1].removable);
        assert_eq!(disks[1].description(), "SD Card Reader");
    }

    #[test]
    fn zero_sized_devices_are_ignored() {
        let tmp = tempdir().unwrap();
        fake_device(tmp.path(), "sdc", "0\n", "1\n");
        assert!(scan_block_devices_in(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn built_in_sd_readers_count_as_removable() {
        let tmp = tempdir().unwrap();
        fake_device(tmp.path(), "mmcblk0", "62333952\n", "0\n");
        fs::write(tmp.path().join("mmcblk0/device/type"), "SD\n").unwrap();
        fake_device(tmp.path(), "mmcblk1", "61071360\n", "0\n");
        fs::write(tmp.path().join("mmcblk1/device/type"), "MMC\n").unwrap();

        let disks = scan_block_devices_in(tmp.path()).unwrap();
        assert_eq!(disks[0].name, "mmcblk0");
        assert!(disks[0].removable);
        assert_eq!(disks[0].size_bytes, 62333952 * 512);
        assert_eq!(disks[1].name, "mmcblk1");
        assert!(!disks[1].removable);
    }

    #[cfg(unix)]
    #[test]
    fn usb_attached_disks_count_as_removable() {
        let tmp = tempdir().unwrap();
        let devices = tmp.path().join("devices/pci0000:00/usb2/2-1/host0/block");
        fake_device(&devices, "sdc", "16\n", "0\n");
        let block = tmp.path().join("block");
        fs::create_dir(&block).unwrap();
        std::os::unix::fs::symlink(devices.join("sdc"), block.join("sdc")).unwrap();

        let disks = scan_block_devices_in(&block).unwrap();
        assert_eq!(disks.len(), 1);
        assert!(disks[0].removable);
    }
}

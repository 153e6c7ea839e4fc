//! Parsing helpers for macOS `diskutil` output.

use crate::Drive;
use std::path::PathBuf;

/// The fields of `diskutil info <disk>` that describe a whole drive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskInfo {
    pub size_bytes: u64,
    pub media_name: String,
    pub internal: bool,
    pub removable: bool,
    pub read_only: bool,
    pub whole: bool,
}

impl DiskInfo {
    /// Snapshot for `device`, written through its unbuffered `rdisk` node.
    pub fn into_drive(self, device: &str, mountpoints: Vec<PathBuf>) -> Drive {
        let hosts_root = mountpoints.iter().any(|mp| mp == &PathBuf::from("/"));
        let mut drive = Drive::new(device, self.size_bytes)
            .with_description(self.media_name)
            .with_mountpoints(mountpoints);
        drive.raw = PathBuf::from(device.replacen("/dev/disk", "/dev/rdisk", 1));
        // The built-in SD slot is internal but reports removable media.
        drive.system = hosts_root || !self.whole || (self.internal && !self.removable);
        drive.protected = self.read_only;
        drive
    }
}

/// Whole physical disks named in `diskutil list` headers
/// (`/dev/disk4 (external, physical):`).
pub fn parse_disk_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (device, kind) = line.trim().split_once(' ')?;
            (device.starts_with("/dev/disk") && kind.contains("physical"))
                .then(|| device.to_string())
        })
        .collect()
}

/// Parse `diskutil info <disk>`. `None` when no size is reported.
pub fn parse_disk_info(output: &str) -> Option<DiskInfo> {
    let mut info = DiskInfo::default();
    let mut size = None;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            // Older releases say "Total Size".
            "Disk Size" | "Total Size" => size = size.or_else(|| byte_count(value)),
            "Device / Media Name" => info.media_name = value.to_string(),
            "Whole" => info.whole = value == "Yes",
            "Internal" => info.internal = value == "Yes",
            "Device Location" => info.internal = value == "Internal",
            "Removable Media" => info.removable = matches!(value, "Removable" | "Yes"),
            "Media Read-Only" => info.read_only = value == "Yes",
            _ => {}
        }
    }
    info.size_bytes = size?;
    Some(info)
}

/// `15.9 GB (15931539456 Bytes) (exactly ...)` -> 15931539456.
fn byte_count(value: &str) -> Option<u64> {
    let (_, rest) = value.split_once('(')?;
    let (count, _) = rest.split_once(" Bytes)")?;
    count.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SD_CARD: &str = "   Device Identifier:         disk4
   Device Node:               /dev/disk4
   Whole:                     Yes
   Part of Whole:             disk4
   Device / Media Name:       SD Card Reader

   Protocol:                  USB
   Disk Size:                 15.9 GB (15931539456 Bytes) (exactly 31116288 512-Byte-Units)
   Device Block Size:         512 Bytes

   Media Read-Only:           No
   Device Location:           External
   Removable Media:           Removable
";

    #[test]
    fn list_keeps_physical_disks_only() {
        let output = "/dev/disk0 (internal, physical):\n   #:  TYPE NAME  SIZE  IDENTIFIER\n\
                      /dev/disk3 (synthesized):\n\
                      /dev/disk4 (external, physical):\n";
        assert_eq!(parse_disk_list(output), vec!["/dev/disk0", "/dev/disk4"]);
    }

    #[test]
    fn external_card_is_a_writable_drive() {
        let info = parse_disk_info(SD_CARD).unwrap();
        assert_eq!(info.size_bytes, 15931539456);
        let drive = info.into_drive("/dev/disk4", vec![PathBuf::from("/Volumes/boot")]);
        assert_eq!(drive.raw, PathBuf::from("/dev/rdisk4"));
        assert_eq!(drive.description, "SD Card Reader");
        assert!(!drive.system);
        assert!(!drive.protected);
    }

    #[test]
    fn internal_fixed_disks_are_system_drives() {
        let info = parse_disk_info(
            "Whole: Yes\nTotal Size: 500.3 GB (500277790720 Bytes)\nInternal: Yes\nRemovable Media: Fixed\n",
        )
        .unwrap();
        assert!(info.into_drive("/dev/disk0", Vec::new()).system);
    }

    #[test]
    fn built_in_sd_slot_is_not_a_system_drive() {
        let text = SD_CARD.replace("External", "Internal");
        let drive = parse_disk_info(&text).unwrap().into_drive("/dev/disk4", Vec::new());
        assert!(!drive.system);
    }

    #[test]
    fn missing_size_is_rejected() {
        assert!(parse_disk_info("Whole: Yes\n").is_none());
    }
}

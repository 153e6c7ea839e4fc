//! Parsing helpers for `/proc/self/mountinfo`.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub source: String,
}

pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            // <id> <parent> <maj:min> <root> <mount point> <...> - <fstype> <source> <superopts>
            let (pre, post) = line.split_once(" - ")?;
            let mount_point = pre.split_whitespace().nth(4)?;
            let source = post.split_whitespace().nth(1)?;
            Some(MountEntry {
                mount_point: PathBuf::from(unescape_mount_path(mount_point)),
                source: source.to_string(),
            })
        })
        .collect()
}

/// True when `source` is `device` itself or one of its partitions
/// (`/dev/sdb1`, `/dev/mmcblk0p1`, `/dev/nvme0n1p2`), never a sibling disk
/// that merely shares the prefix (`/dev/sdba1`, `/dev/mmcblk10`).
pub fn is_device_or_partition(source: &str, device: &str) -> bool {
    let Some(rest) = source.strip_prefix(device) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    // Names ending in a digit separate the partition number with a `p`.
    let digits = if device.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Mountpoints whose source is the device itself or one of its partitions,
/// in mount table order.
pub fn mountpoints_for_device(entries: &[MountEntry], dev_path: &Path) -> Vec<PathBuf> {
    let device = dev_path.to_string_lossy();
    let mut mounts: Vec<PathBuf> = Vec::new();
    for entry in entries {
        if is_device_or_partition(&entry.source, &device) && !mounts.contains(&entry.mount_point) {
            mounts.push(entry.mount_point.clone());
        }
    }
    mounts
}

pub fn root_mount_source(entries: &[MountEntry]) -> Option<&str> {
    entries
        .iter()
        .find(|e| e.mount_point == Path::new("/"))
        .map(|e| e.source.as_str())
}

pub fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

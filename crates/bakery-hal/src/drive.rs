//! Removable drive descriptors as reported by the host.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A snapshot of a drive as the OS reports it.
///
/// Snapshots are never updated in place; re-query the HAL to observe mount
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    /// Identifier used to re-query the drive (e.g. `/dev/sdb`, `/dev/disk2`).
    pub device: String,
    /// Path opened for raw writes (e.g. `/dev/sdb`, `/dev/rdisk2`).
    pub raw: PathBuf,
    #[serde(default)]
    pub description: String,
    pub size: u64,
    #[serde(default)]
    pub mountpoints: Vec<PathBuf>,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub protected: bool,
}

impl Drive {
    pub fn new(device: impl Into<String>, size: u64) -> Self {
        let device = device.into();
        Self {
            raw: PathBuf::from(&device),
            device,
            description: String::new(),
            size,
            mountpoints: Vec::new(),
            system: false,
            protected: false,
        }
    }

    pub fn with_mountpoints<I, P>(mut self, mountpoints: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.mountpoints = mountpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn first_mountpoint(&self) -> Option<&Path> {
        self.mountpoints.first().map(PathBuf::as_path)
    }
}

/// One device-mapper node created for a partition of a raw device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    pub name: String,
    pub size_sectors: u64,
}

impl PartitionMap {
    pub fn mapper_path(&self) -> PathBuf {
        Path::new("/dev/mapper").join(&self.name)
    }
}

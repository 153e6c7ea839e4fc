//! Bakery host abstraction layer (HAL).
//!
//! Everything that touches the host's disks, mount table or external tools goes
//! through the traits in [`hal`], so the pipeline can be exercised against
//! [`FakeHal`] without root or real hardware.

pub mod diskutil;
pub mod drive;
pub mod hal;
pub mod procfs;
pub mod sysfs;

pub use bakery_error::{HalError, HalResult};
pub use drive::{Drive, PartitionMap};
pub use hal::{
    DriveOps, FakeHal, FailPoint, FlashOps, FlashOptions, FlashProgress, FlashReport, HostHal,
    MountOps, MountOptions, Operation, PartitionMapOps, ProbeOps, SystemHal, SystemOps,
};

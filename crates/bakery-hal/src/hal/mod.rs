//! HAL trait definitions and implementations.
//!
//! One trait per concern, a real [`HostHal`] and a recording [`FakeHal`].

pub mod drive_ops;
pub mod fake_hal;
pub mod flash_ops;
pub mod host_hal;
pub mod mount_ops;
pub mod partition_map_ops;
pub mod probe_ops;
pub mod system_ops;

pub use drive_ops::DriveOps;
pub use fake_hal::{FailPoint, FakeHal, Operation};
pub use flash_ops::{FlashOps, FlashOptions, FlashProgress, FlashReport};
pub use host_hal::HostHal;
pub use mount_ops::{MountOps, MountOptions};
pub use partition_map_ops::PartitionMapOps;
pub use probe_ops::ProbeOps;
pub use system_ops::SystemOps;

/// Complete HAL combining all host operation traits.
pub trait SystemHal:
    DriveOps + MountOps + PartitionMapOps + FlashOps + ProbeOps + SystemOps + Send + Sync
{
}

impl<T> SystemHal for T where
    T: DriveOps + MountOps + PartitionMapOps + FlashOps + ProbeOps + SystemOps + Send + Sync
{
}

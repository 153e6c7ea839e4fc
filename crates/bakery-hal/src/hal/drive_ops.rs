//! Drive enumeration.

use crate::{Drive, HalResult};

pub trait DriveOps {
    /// Every drive the host reports, removable or not.
    fn list_drives(&self) -> HalResult<Vec<Drive>>;

    /// A fresh snapshot of one drive, looked up by its device identifier.
    fn drive_by_device(&self, device: &str) -> HalResult<Option<Drive>> {
        Ok(self
            .list_drives()?
            .into_iter()
            .find(|drive| drive.device == device))
    }
}

//! System-level operations (sync, privileges, timers).

use crate::HalResult;
use std::time::Duration;

pub trait SystemOps {
    /// Best-effort filesystem sync.
    fn sync(&self) -> HalResult<()>;

    /// Block the caller between polls.
    fn pause(&self, duration: Duration);

    /// True when the current process may open raw devices.
    fn is_elevated(&self) -> bool;
}

//! Raw image writes to the card.

use crate::progress::Progress;
use bakery_error::{BakeryError, BakeryResult, HalError};
use bakery_hal::{Drive, FlashOptions, FlashProgress, FlashReport, SystemHal};
use std::path::Path;

pub const STATUS_UNMOUNTING: &str = "Unmounting SD card...";
pub const STATUS_PREPARING: &str = "Preparing for write...";
pub const STATUS_WRITING: &str = "Writing IMG to SD card...";

/// Unmount `drive`, then stream `image` onto its raw device.
///
/// Assumes the process already has raw device access. The device is closed
/// before this returns, so a returned report means the data is on the card.
pub fn write_image(
    hal: &dyn SystemHal,
    image: &Path,
    drive: &Drive,
    opts: &FlashOptions,
    progress: &Progress,
) -> BakeryResult<FlashReport> {
    progress.status(STATUS_UNMOUNTING);
    hal.unmount_disk(drive, opts.dry_run)
        .map_err(|source| BakeryError::UnmountFailure {
            device: drive.device.clone(),
            source,
        })?;

    progress.status(STATUS_PREPARING);
    let image_size = std::fs::metadata(image)
        .map_err(|e| BakeryError::WriteFailure {
            device: drive.device.clone(),
            reason: format!("cannot read {}: {e}", image.display()),
        })?
        .len();
    if image_size > drive.size {
        return Err(BakeryError::ImageTooSmall {
            device_size: drive.size,
            image_size,
        });
    }

    progress.status(STATUS_WRITING);
    let report = hal
        .flash_raw_image(image, &drive.raw, opts, &mut |p: FlashProgress| {
            progress.bytes(p.transferred, p.length)
        })
        .map_err(|err| BakeryError::WriteFailure {
            device: drive.device.clone(),
            reason: match err {
                HalError::ValidationFailed(detail) => format!("validation failed: {detail}"),
                other => other.to_string(),
            },
        })?;

    if let Err(err) = hal.sync() {
        log::warn!("⚠️ sync after write failed: {err}");
    }
    log::info!(
        "✅ Wrote {} bytes to {} (sha256 {})",
        report.bytes_written,
        drive.device,
        report.sha256
    );
    Ok(report)
}

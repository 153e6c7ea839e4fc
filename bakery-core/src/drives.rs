//! Choosing which drives are offered as SD cards.

use bakery_error::BakeryResult;
use bakery_hal::{Drive, SystemHal};
use std::path::PathBuf;

/// Present on the boot partition of any Raspbian image.
pub const RASPBIAN_MARKER: &str = "bootcode.bin";
/// Present on cards that already carry our boot scripts.
pub const PREPARED_MARKER: &str = "PiBakery/blocks.xml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub drive: Drive,
}

/// Display name of a drive, or `None` when it cannot be shown to the user.
///
/// A card is named after its first mountpoint, so an unmounted card is not
/// offered.
pub fn display_name(drive: &Drive) -> Option<String> {
    drive
        .first_mountpoint()
        .and_then(|mp| mp.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

/// Removable, writable drives with a usable name.
pub fn candidates(hal: &dyn SystemHal) -> BakeryResult<Vec<Candidate>> {
    let drives = hal.list_drives()?;
    let found: Vec<Candidate> = drives
        .into_iter()
        .filter(|drive| !drive.system && !drive.protected)
        .filter_map(|drive| {
            display_name(&drive).map(|name| Candidate { name, drive })
        })
        .collect();
    log::debug!("Found {} candidate drive(s)", found.len());
    Ok(found)
}

/// Drives where some mountpoint holds `relative`, paired with the first
/// such mountpoint.
pub fn drives_with_file(
    hal: &dyn SystemHal,
    drives: Vec<Candidate>,
    relative: &str,
) -> Vec<(Candidate, PathBuf)> {
    drives
        .into_iter()
        .filter_map(|candidate| {
            let hit = candidate
                .drive
                .mountpoints
                .iter()
                .find(|mp| hal.file_readable(&mp.join(relative)))
                .cloned();
            hit.map(|mp| (candidate, mp))
        })
        .collect()
}

//! Redirecting the card's boot into the bakery init script.

pub mod cmdline;

use bakery_error::{BakeryError, BakeryResult};
use std::fs;
use std::path::Path;

pub use cmdline::Cmdline;

pub const CMDLINE: &str = "cmdline.txt";
/// Backup of the untouched command line; its presence marks a prepared card.
pub const CMDLINE_BACKUP: &str = "PiBakery/cmdline.txt.original";

/// Parameters the boot partition's command line is pointed at.
pub const REDIRECT: [(&str, &str); 4] = [
    ("root", "/dev/mmcblk0p1"),
    ("rootfstype", "vfat"),
    ("rootflags", "umask=000"),
    ("init", "/PiBakery/pibakery-mount.sh"),
];

fn stage_err(reason: String) -> BakeryError {
    BakeryError::InstallStepFailure {
        stage: "rewrite-cmdline".to_string(),
        reason,
        cleanup: None,
    }
}

/// Apply [`REDIRECT`] to `cmdline.txt` under `boot`, keeping the original in
/// [`CMDLINE_BACKUP`]. Returns `false` when the card was already redirected.
///
/// The backup is written last and only once the rewrite succeeded, so a
/// failed attempt leaves the card looking unprepared.
pub fn redirect_init(boot: &Path) -> BakeryResult<bool> {
    let original = boot.join(CMDLINE);
    let backup = boot.join(CMDLINE_BACKUP);
    if backup.exists() {
        log::info!("Boot command line already redirected; leaving it alone");
        return Ok(false);
    }

    let contents = fs::read_to_string(&original)
        .map_err(|e| stage_err(format!("cannot read {}: {e}", original.display())))?;

    let mut cmdline = Cmdline::parse(&contents);
    for (key, value) in REDIRECT {
        cmdline.set(key, value);
    }
    fs::write(&original, cmdline.to_string())
        .map_err(|e| stage_err(format!("cannot write {}: {e}", original.display())))?;

    if let Err(err) = fs::write(&backup, &contents) {
        if let Err(restore) = fs::write(&original, &contents) {
            log::error!("❌ Could not restore {}: {restore}", original.display());
        }
        return Err(stage_err(format!(
            "cannot back up {} to {}: {err}",
            original.display(),
            backup.display()
        )));
    }
    log::info!("✅ Boot command line now starts {}", REDIRECT[3].1);
    Ok(true)
}

//! Tool configuration (`bakery.toml`).

use bakery_error::{BakeryError, BakeryResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a config file when `--config` is not given.
pub const CONFIG_ENV: &str = "BAKERY_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeryConfig {
    /// Support files copied to every card (`busybox`, `pibakery-mount.sh`, ...).
    pub resources_dir: PathBuf,
    /// Block packs, loaded in order; later packs override earlier ones.
    pub block_dirs: Vec<PathBuf>,
    /// Pack used when none of `block_dirs` loads.
    pub fallback_blocks_dir: Option<PathBuf>,
    /// File that proves a mountpoint is the card's boot partition.
    pub boot_marker: String,
    pub poll_interval_secs: u64,
    /// Remount polls on macOS and Windows.
    pub remote_attempts: u32,
    /// Remount polls on Linux before falling back to a manual mount.
    pub unix_attempts: u32,
    pub verify_writes: bool,
    pub log_file: Option<PathBuf>,
}

impl Default for BakeryConfig {
    fn default() -> Self {
        Self {
            resources_dir: PathBuf::from("resources"),
            block_dirs: vec![PathBuf::from("pibakery-blocks")],
            fallback_blocks_dir: None,
            boot_marker: "bootcode.bin".to_string(),
            poll_interval_secs: 5,
            remote_attempts: 12,
            unix_attempts: 3,
            verify_writes: true,
            log_file: None,
        }
    }
}

impl BakeryConfig {
    /// Load from `path`, else `$BAKERY_CONFIG`, else defaults.
    pub fn load(path: Option<&Path>) -> BakeryResult<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> BakeryResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BakeryError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| BakeryError::Config(format!("{}: {e}", path.display())))?;
        log::info!("📝 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> BakeryResult<()> {
        if self.poll_interval_secs == 0 {
            return Err(BakeryError::Config(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.remote_attempts == 0 || self.unix_attempts == 0 {
            return Err(BakeryError::Config(
                "remount attempts must be at least 1".to_string(),
            ));
        }
        if self.boot_marker.trim().is_empty() {
            return Err(BakeryError::Config("boot_marker is empty".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

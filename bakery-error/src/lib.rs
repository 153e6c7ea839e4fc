use std::io;
use thiserror::Error;

pub type HalResult<T> = Result<T, HalError>;
pub type BakeryResult<T> = Result<T, BakeryError>;

#[derive(Error, Debug)]
pub enum HalError {
    #[error("Disk is busy (mounted or in use)")]
    DiskBusy,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command failed: {program} (exit={code:?}): {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command timed out: {program} after {timeout_secs}s")]
    CommandTimeout { program: String, timeout_secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[cfg(unix)]
    #[error("nix errno: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Failures of the write / mount / install pipeline.
///
/// Each variant maps to one user-facing error kind with a stable code, a title
/// and a suggested remedy.
#[derive(Error, Debug)]
pub enum BakeryError {
    #[error(transparent)]
    Hal(#[from] HalError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Could not unmount {device}: {source}")]
    UnmountFailure {
        device: String,
        #[source]
        source: HalError,
    },

    #[error(
        "The chosen device is not large enough for the chosen image. Device: {device_size}. Image: {image_size}"
    )]
    ImageTooSmall { device_size: u64, image_size: u64 },

    #[error("Writing to {device} failed: {reason}")]
    WriteFailure { device: String, reason: String },

    #[error("{} Device: {device}", remount_detail(.mounted))]
    RemountTimeout { device: String, mounted: bool },

    #[error("{detail} Device: {device}")]
    AmbiguousMountpoints { device: String, detail: String },

    #[error("The system does not have kpartx installed. Please install kpartx and try again")]
    MissingPartitionTool,

    #[error("Could not map the partitions of {device}: {reason}{}", teardown_suffix(.teardown))]
    PartitionMapFailure {
        device: String,
        reason: String,
        teardown: Option<String>,
    },

    #[error("Install step '{stage}' failed: {reason}{}", cleanup_suffix(.cleanup))]
    InstallStepFailure {
        stage: String,
        reason: String,
        /// Failure of the cleanup attempted after the failed install.
        cleanup: Option<String>,
    },

    #[error("Cleanup failed: {0}")]
    CleanupFailure(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    DownloadIntegrityFailure {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Image unavailable: {0}")]
    DownloadFailure(String),

    #[error("Could not extract {path}: {reason}")]
    ExtractFailure { path: String, reason: String },

    #[error("Could not obtain elevated privileges: {0}")]
    Elevation(String),

    #[error("Writer channel error: {0}")]
    Ipc(String),

    /// An error reported by the elevated writer process, carried by code.
    #[error("{message}")]
    Worker { code: String, message: String },

    #[error("Unknown block: {0}")]
    UnknownBlock(String),

    #[error("Block definition error: {0}")]
    Block(String),

    #[error("Recipe error: {0}")]
    Recipe(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn remount_detail(mounted: &bool) -> &'static str {
    if *mounted {
        "The device remounted, but bootcode.bin could not be read."
    } else {
        "The device did not remount automatically. No attempt was made to remount the device manually."
    }
}

fn teardown_suffix(teardown: &Option<String>) -> String {
    match teardown {
        Some(err) => format!(" (removing the partition mappings also failed: {err})"),
        None => String::new(),
    }
}

fn cleanup_suffix(cleanup: &Option<String>) -> String {
    match cleanup {
        Some(err) => format!(" (cleaning up afterwards also failed: {err})"),
        None => String::new(),
    }
}

impl BakeryError {
    /// Stable identifier, shared with the elevated writer's wire format.
    pub fn code(&self) -> &str {
        match self {
            BakeryError::Hal(_) => "HAL_ERROR",
            BakeryError::Io(_) => "IO_ERROR",
            BakeryError::UnmountFailure { .. } => "UNMOUNT_FAILED",
            BakeryError::ImageTooSmall { .. } => "SD_TOO_SMALL",
            BakeryError::WriteFailure { .. } => "WRITE_FAILED",
            BakeryError::RemountTimeout { .. } => "DID_NOT_REMOUNT",
            BakeryError::AmbiguousMountpoints { .. } => "TOO_MANY_MOUNTPOINTS",
            BakeryError::MissingPartitionTool => "MISSING_KPARTX",
            BakeryError::PartitionMapFailure { .. } => "KPARTX_ADD_ERROR",
            BakeryError::InstallStepFailure { .. } => "INSTALL_FAILED",
            BakeryError::CleanupFailure(_) => "CLEANUP_FAILED",
            BakeryError::DownloadIntegrityFailure { .. } => "CHECKSUM_MISMATCH",
            BakeryError::DownloadFailure(_) => "DOWNLOAD_FAILED",
            BakeryError::ExtractFailure { .. } => "EXTRACT_FAILED",
            BakeryError::Elevation(_) => "ELEVATION_FAILED",
            BakeryError::Ipc(_) => "IPC_FAILED",
            BakeryError::Worker { code, .. } => code,
            BakeryError::UnknownBlock(_) => "UNKNOWN_BLOCK",
            BakeryError::Block(_) => "BLOCK_INVALID",
            BakeryError::Recipe(_) => "RECIPE_INVALID",
            BakeryError::Config(_) => "CONFIG_INVALID",
        }
    }

    pub fn title(&self) -> &'static str {
        match self.code() {
            "UNMOUNT_FAILED" => "Could not unmount the SD card",
            "SD_TOO_SMALL" => "SD card too small",
            "WRITE_FAILED" => "Writing the image failed",
            "DID_NOT_REMOUNT" => "SD card did not remount",
            "TOO_MANY_MOUNTPOINTS" => "Boot partition not found",
            "MISSING_KPARTX" => "kpartx is missing",
            "KPARTX_ADD_ERROR" => "Could not mount the boot partition",
            "INSTALL_FAILED" => "Could not install the boot scripts",
            "CLEANUP_FAILED" => "Cleanup failed",
            "CHECKSUM_MISMATCH" => "Image checksum mismatch",
            "DOWNLOAD_FAILED" => "Image unavailable",
            "EXTRACT_FAILED" => "Could not extract the image",
            "ELEVATION_FAILED" => "Administrator rights required",
            "IPC_FAILED" | "HAL_ERROR" | "IO_ERROR" => "Can't write to SD card",
            "UNKNOWN_BLOCK" | "BLOCK_INVALID" => "Block problem",
            "RECIPE_INVALID" => "Recipe could not be read",
            "CONFIG_INVALID" => "Invalid configuration",
            _ => "Can't write to SD card",
        }
    }

    pub fn remedy(&self) -> &'static str {
        match self.code() {
            "UNMOUNT_FAILED" => "Ensure nothing else is using the device, then try again.",
            "SD_TOO_SMALL" => "Use a larger card.",
            "WRITE_FAILED" | "IPC_FAILED" | "HAL_ERROR" | "IO_ERROR" => {
                "Reinsert the card and try again."
            }
            "DID_NOT_REMOUNT" | "TOO_MANY_MOUNTPOINTS" => {
                "Remove and reinsert the card, then use Update to install the scripts."
            }
            "MISSING_KPARTX" => "Install kpartx and try again.",
            "KPARTX_ADD_ERROR" => "Ensure nothing else is using the device, then try again.",
            "INSTALL_FAILED" => "Check the card is not write protected and try again.",
            "CLEANUP_FAILED" => "The card was written; unmount it manually before removing it.",
            "CHECKSUM_MISMATCH" | "DOWNLOAD_FAILED" => "Download the image again.",
            "EXTRACT_FAILED" => "Download the image again or extract it manually.",
            "ELEVATION_FAILED" => "Run the tool as an administrator.",
            "UNKNOWN_BLOCK" | "BLOCK_INVALID" => "Reinstall the block pack.",
            "RECIPE_INVALID" => "Check the recipe file was exported by this tool.",
            "CONFIG_INVALID" => "Fix the configuration file and try again.",
            _ => "Try again.",
        }
    }

    /// True for failures that happen after the card was written and prepared.
    pub fn is_cleanup(&self) -> bool {
        matches!(self, BakeryError::CleanupFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_small_message_names_both_sizes() {
        let err = BakeryError::ImageTooSmall {
            device_size: 100,
            image_size: 200,
        };
        assert_eq!(err.code(), "SD_TOO_SMALL");
        assert_eq!(
            err.to_string(),
            "The chosen device is not large enough for the chosen image. Device: 100. Image: 200"
        );
        assert_eq!(err.remedy(), "Use a larger card.");
    }

    #[test]
    fn remount_message_depends_on_mount_state() {
        let never = BakeryError::RemountTimeout {
            device: "/dev/disk2".into(),
            mounted: false,
        };
        assert!(never.to_string().starts_with("The device did not remount"));
        assert!(never.to_string().ends_with("Device: /dev/disk2"));

        let unverified = BakeryError::RemountTimeout {
            device: "/dev/disk2".into(),
            mounted: true,
        };
        assert!(unverified.to_string().contains("bootcode.bin could not be read"));
    }

    #[test]
    fn partition_map_failure_keeps_teardown_error() {
        let err = BakeryError::PartitionMapFailure {
            device: "/dev/sdb".into(),
            reason: "mount: wrong fs type".into(),
            teardown: Some("kpartx -d failed".into()),
        };
        let text = err.to_string();
        assert!(text.contains("mount: wrong fs type"));
        assert!(text.contains("kpartx -d failed"));
    }

    #[test]
    fn worker_errors_keep_their_code() {
        let err = BakeryError::Worker {
            code: "SD_TOO_SMALL".into(),
            message: "too small".into(),
        };
        assert_eq!(err.code(), "SD_TOO_SMALL");
        assert_eq!(err.title(), "SD card too small");
    }
}

//! Installing the boot scripts onto a mounted boot partition, and undoing a
//! manual mount afterwards.

use crate::boot_config;
use crate::compiler::ScriptBundle;
use crate::phase::Phase;
use crate::progress::{Progress, ProgressUpdate};
use anyhow::{Context, Result};
use bakery_error::{BakeryError, BakeryResult};
use bakery_hal::{Drive, SystemHal};
use bakery_workflow::stage_runner::{StageDefinition, StageEvent, StageRunner, WorkflowState};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directory on the boot partition that holds everything we install.
pub const INSTALL_DIR: &str = "PiBakery";
pub const BLOCKS_DIR: &str = "blocks";
pub const RECIPE_FILE: &str = "blocks.xml";
/// Support files copied from the resources directory on every install.
pub const SUPPORT_FILES: [&str; 4] = [
    "busybox",
    "pibakery-mount.sh",
    "pibakery-install.sh",
    "pibakery-raspbian",
];
pub const RUN_FIRST_BOOT: &str = "runFirstBoot";
pub const RUN_NEXT_BOOT: &str = "runNextBoot";

pub const STAGE_CREATE_DIRECTORIES: &str = "create-directories";
pub const STAGE_REWRITE_CMDLINE: &str = "rewrite-cmdline";
pub const STAGE_COPY_PAYLOAD: &str = "copy-payload";
pub const STAGE_WRITE_SCRIPTS: &str = "write-scripts";

/// Whether the card was just written or is being updated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    Write,
    Update,
}

impl InstallMode {
    /// The one run flag this mode enables on the card.
    pub fn run_flag(self) -> &'static str {
        match self {
            InstallMode::Write => RUN_FIRST_BOOT,
            InstallMode::Update => RUN_NEXT_BOOT,
        }
    }
}

pub fn wait_flag(phase: Phase) -> String {
    format!("waitForNetwork{}", phase.enabler_suffix())
}

/// Everything one install needs.
pub struct InstallRequest<'a> {
    pub mountpoint: &'a Path,
    pub bundle: &'a ScriptBundle,
    /// Recipe document saved next to the scripts for later editing.
    pub recipe_xml: &'a str,
    pub resources_dir: &'a Path,
    pub mode: InstallMode,
}

impl InstallRequest<'_> {
    fn root(&self) -> PathBuf {
        self.mountpoint.join(INSTALL_DIR)
    }
}

#[derive(Debug, Default)]
struct InstallState {
    current: Option<String>,
    completed: BTreeSet<String>,
}

impl WorkflowState for InstallState {
    fn is_completed(&self, stage: &str) -> bool {
        self.completed.contains(stage)
    }

    fn set_current(&mut self, stage: &str) {
        self.current = Some(stage.to_string());
    }

    fn mark_completed(&mut self, stage: &str) {
        self.completed.insert(stage.to_string());
    }
}

/// Run the install stages in order; the first failure aborts and names its
/// stage.
pub fn install(request: &InstallRequest<'_>, progress: &Progress, dry_run: bool) -> BakeryResult<()> {
    log::info!(
        "📦 Installing boot scripts to {} ({:?} mode)",
        request.mountpoint.display(),
        request.mode
    );

    let stages = vec![
        StageDefinition::new(STAGE_CREATE_DIRECTORIES, |_: &mut InstallState, dry_run| {
            progress.status("Creating directories...");
            create_directories(request, dry_run)
        }),
        StageDefinition::new(STAGE_REWRITE_CMDLINE, |_: &mut InstallState, dry_run| {
            progress.status("Modifying cmdline.txt...");
            if dry_run {
                log::info!("DRY RUN: would redirect init in {}", boot_config::CMDLINE);
                return Ok(());
            }
            boot_config::redirect_init(request.mountpoint)?;
            Ok(())
        }),
        StageDefinition::new(STAGE_COPY_PAYLOAD, |_: &mut InstallState, dry_run| {
            progress.status("Copying blocks...");
            copy_payload(request, dry_run)
        }),
        StageDefinition::new(STAGE_WRITE_SCRIPTS, |_: &mut InstallState, dry_run| {
            progress.status("Writing boot scripts...");
            write_scripts(request, dry_run)
        }),
    ];

    let mut state = InstallState::default();
    StageRunner::new(dry_run)
        .with_observer(|event| match event {
            StageEvent::Started(name) => progress.send(ProgressUpdate::StageStarted(name.to_string())),
            StageEvent::Completed(name) => {
                progress.send(ProgressUpdate::StageCompleted(name.to_string()))
            }
        })
        .run(&mut state, &stages)
        .map_err(|failure| BakeryError::InstallStepFailure {
            stage: failure.stage,
            reason: format!("{:#}", failure.source),
            cleanup: None,
        })?;

    log::info!("✅ Boot scripts installed");
    Ok(())
}

fn create_directories(request: &InstallRequest<'_>, dry_run: bool) -> Result<()> {
    let root = request.root();
    if dry_run {
        log::info!("DRY RUN: would create {}", root.display());
        return Ok(());
    }
    if request.mode == InstallMode::Update {
        clear_previous(&root)?;
    }
    // create_dir_all tolerates an existing directory.
    fs::create_dir_all(root.join(BLOCKS_DIR))
        .with_context(|| format!("failed to create {}", root.display()))
}

/// Remove what an earlier install left that this one rewrites.
fn clear_previous(root: &Path) -> Result<()> {
    remove_if_present(&root.join(BLOCKS_DIR))?;
    let mut stale: Vec<String> = Phase::ALL
        .iter()
        .flat_map(|phase| [phase.script_name().to_string(), wait_flag(*phase)])
        .collect();
    stale.extend([
        RECIPE_FILE.to_string(),
        RUN_FIRST_BOOT.to_string(),
        RUN_NEXT_BOOT.to_string(),
    ]);
    for name in stale {
        remove_if_present(&root.join(name))?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            Err(err).with_context(|| format!("failed to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

fn copy_payload(request: &InstallRequest<'_>, dry_run: bool) -> Result<()> {
    let root = request.root();
    for name in SUPPORT_FILES {
        let from = request.resources_dir.join(name);
        if dry_run {
            log::info!("DRY RUN: would copy {}", from.display());
            continue;
        }
        copy_tree(&from, &root.join(name))?;
    }
    for (name, folder) in request.bundle.blocks() {
        let to = root.join(BLOCKS_DIR).join(name);
        if dry_run {
            log::info!("DRY RUN: would copy block {name} from {}", folder.display());
            continue;
        }
        log::debug!("Copying block {name} from {}", folder.display());
        copy_tree(folder, &to)?;
    }
    Ok(())
}

/// Copy a file, or a directory and everything under it.
pub fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    if from.is_file() {
        fs::copy(from, to)
            .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
        return Ok(());
    }
    for entry in WalkDir::new(from).follow_links(true) {
        let entry = entry.with_context(|| format!("failed to read {}", from.display()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .context("failed to compute relative path")?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

fn write_scripts(request: &InstallRequest<'_>, dry_run: bool) -> Result<()> {
    let root = request.root();
    let scripts = &request.bundle.scripts;
    if dry_run {
        log::info!("DRY RUN: would write scripts to {}", root.display());
        return Ok(());
    }

    for phase in Phase::ALL {
        let path = root.join(phase.script_name());
        fs::write(&path, scripts.script(phase))
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    let recipe = root.join(RECIPE_FILE);
    fs::write(&recipe, request.recipe_xml)
        .with_context(|| format!("failed to write {}", recipe.display()))?;

    let mut flags = vec![request.mode.run_flag().to_string()];
    flags.extend(
        Phase::ALL
            .into_iter()
            .filter(|phase| scripts.waits_for_network(*phase))
            .map(wait_flag),
    );
    for flag in flags {
        let path = root.join(&flag);
        fs::write(&path, b"").with_context(|| format!("failed to create {}", path.display()))?;
        log::debug!("📝 Enabled {flag}");
    }
    Ok(())
}

/// Undo a manual mount: unmount, remove the mount directory, then remove the
/// partition mappings. Nothing to do for automatic mounts or off Linux.
pub fn cleanup(
    hal: &dyn SystemHal,
    drive: &Drive,
    mountpoint: &Path,
    manual: bool,
    dry_run: bool,
) -> BakeryResult<()> {
    if !manual || !cfg!(target_os = "linux") {
        return Ok(());
    }
    log::info!("⏏️ Cleaning up manual mount at {}", mountpoint.display());

    hal.unmount(mountpoint, dry_run).map_err(|e| {
        BakeryError::CleanupFailure(format!("unmounting {}: {e}", mountpoint.display()))
    })?;
    if !dry_run {
        fs::remove_dir(mountpoint).map_err(|e| {
            BakeryError::CleanupFailure(format!("removing {}: {e}", mountpoint.display()))
        })?;
    }
    hal.delete_partition_maps(&drive.device).map_err(|e| {
        BakeryError::CleanupFailure(format!("removing partition mappings of {}: {e}", drive.device))
    })?;
    log::info!("✅ Cleanup complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, ScriptBundle};
    use bakery_hal::{FailPoint, FakeHal, Operation};
    use std::sync::mpsc;
    use tempfile::{tempdir, TempDir};

    struct Card {
        _dir: TempDir,
        boot: PathBuf,
        resources: PathBuf,
        bundle: ScriptBundle,
    }

    fn card() -> Card {
        let dir = tempdir().unwrap();
        let boot = dir.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("cmdline.txt"), "console=tty1 root=/dev/mmcblk0p2 rootwait\n").unwrap();

        let resources = dir.path().join("resources");
        fs::create_dir_all(resources.join("pibakery-raspbian/etc")).unwrap();
        fs::write(resources.join("pibakery-raspbian/etc/rc.local"), "exit 0\n").unwrap();
        for file in ["busybox", "pibakery-mount.sh", "pibakery-install.sh"] {
            fs::write(resources.join(file), file).unwrap();
        }

        let block_dir = dir.path().join("packs/base/hostname");
        fs::create_dir_all(&block_dir).unwrap();
        fs::write(block_dir.join("hostname.sh"), "#!/bin/bash\n").unwrap();

        let scripts = compile(&[
            "_pibakery-onfirstboot",
            "\tchmod 755 /boot/PiBakery/blocks/hostname/hostname.sh",
            "\t/boot/PiBakery/blocks/hostname/hostname.sh pi",
            "\tNETWORK=True",
            "",
        ]);
        let bundle = ScriptBundle {
            scripts,
            block_paths: vec![block_dir],
        };
        Card {
            _dir: dir,
            boot,
            resources,
            bundle,
        }
    }

    fn request(card: &Card, mode: InstallMode) -> InstallRequest<'_> {
        InstallRequest {
            mountpoint: &card.boot,
            bundle: &card.bundle,
            recipe_xml: "<xml></xml>",
            resources_dir: &card.resources,
            mode,
        }
    }

    #[test]
    fn write_mode_lays_out_the_card() {
        let card = card();
        let (tx, rx) = mpsc::channel();
        install(&request(&card, InstallMode::Write), &Progress::new(tx), false).unwrap();

        let root = card.boot.join(INSTALL_DIR);
        for name in ["everyBoot.sh", "firstBoot.sh", "nextBoot.sh", "blocks.xml", "busybox"] {
            assert!(root.join(name).is_file(), "{name} missing");
        }
        assert!(root.join("pibakery-raspbian/etc/rc.local").is_file());
        assert!(root.join("blocks/hostname/hostname.sh").is_file());
        assert!(root.join(RUN_FIRST_BOOT).is_file());
        assert!(!root.join(RUN_NEXT_BOOT).exists());
        assert!(root.join("waitForNetworkFirstBoot").is_file());
        assert!(!root.join("waitForNetworkEveryBoot").exists());
        assert!(root.join("cmdline.txt.original").is_file());

        let statuses: Vec<String> = rx
            .try_iter()
            .filter_map(|u| match u {
                ProgressUpdate::Status(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(statuses[0], "Creating directories...");
        assert_eq!(statuses.last().map(String::as_str), Some("Writing boot scripts..."));
    }

    #[test]
    fn update_mode_replaces_stale_files() {
        let card = card();
        install(&request(&card, InstallMode::Write), &Progress::silent(), false).unwrap();
        let root = card.boot.join(INSTALL_DIR);
        fs::create_dir_all(root.join("blocks/oldblock")).unwrap();
        let cmdline = fs::read_to_string(card.boot.join("cmdline.txt")).unwrap();

        install(&request(&card, InstallMode::Update), &Progress::silent(), false).unwrap();
        assert!(!root.join("blocks/oldblock").exists());
        assert!(!root.join(RUN_FIRST_BOOT).exists());
        assert!(root.join(RUN_NEXT_BOOT).is_file());
        // The second install must not chain the init redirection again.
        assert_eq!(fs::read_to_string(card.boot.join("cmdline.txt")).unwrap(), cmdline);
    }

    #[test]
    fn missing_cmdline_names_the_stage() {
        let card = card();
        fs::remove_file(card.boot.join("cmdline.txt")).unwrap();
        let err = install(&request(&card, InstallMode::Write), &Progress::silent(), false)
            .unwrap_err();
        match err {
            BakeryError::InstallStepFailure { stage, .. } => {
                assert_eq!(stage, STAGE_REWRITE_CMDLINE)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!card.boot.join(INSTALL_DIR).join("everyBoot.sh").exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cleanup_unmounts_before_unmapping() {
        let dir = tempdir().unwrap();
        let mountpoint = dir.path().join("pibakeryboot1");
        fs::create_dir(&mountpoint).unwrap();
        let hal = FakeHal::new();
        cleanup(&hal, &Drive::new("/dev/sdz", 1), &mountpoint, true, false).unwrap();

        let ops = hal.operations();
        let unmount = ops
            .iter()
            .position(|op| matches!(op, Operation::Unmount { .. }))
            .unwrap();
        let unmap = ops
            .iter()
            .position(|op| matches!(op, Operation::DeletePartitionMaps { .. }))
            .unwrap();
        assert!(unmount < unmap);
        assert!(!mountpoint.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_unmount_stops_cleanup() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new().fail_on(FailPoint::Unmount);
        let err = cleanup(&hal, &Drive::new("/dev/sdz", 1), dir.path(), true, false).unwrap_err();
        assert_eq!(err.code(), "CLEANUP_FAILED");
        assert!(!hal.has_operation(|op| matches!(op, Operation::DeletePartitionMaps { .. })));
    }

    #[test]
    fn automatic_mounts_need_no_cleanup() {
        let hal = FakeHal::new();
        cleanup(&hal, &Drive::new("/dev/sdz", 1), Path::new("/media/boot"), false, false).unwrap();
        assert!(hal.operations().is_empty());
    }
}

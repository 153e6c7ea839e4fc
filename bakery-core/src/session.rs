//! The write, update and load flows, end to end.

use crate::blocks::BlockRegistry;
use crate::compiler::{self, ScriptBundle};
use crate::config::BakeryConfig;
use crate::drives::PREPARED_MARKER;
use crate::elevate;
use crate::graph::Workspace;
use crate::image;
use crate::installer::{self, InstallMode, InstallRequest};
use crate::phase::Phase;
use crate::progress::Progress;
use crate::recipe::{self, Recipe};
use crate::resolver::{Resolver, Strategy};
use crate::validator::{self, Repair};
use bakery_error::{BakeryError, BakeryResult};
use bakery_hal::{Drive, FlashOptions, FlashReport, SystemHal};
use std::path::{Path, PathBuf};

/// What one write or update session knows about its card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub drive: Drive,
    pub mode: InstallMode,
    /// The boot partition was mapped and mounted by us; cleanup must undo it.
    pub used_manual_mount: bool,
}

/// A recipe turned into everything the installer writes.
#[derive(Debug, Clone)]
pub struct PreparedRecipe {
    pub bundle: ScriptBundle,
    /// The recipe as saved on the card.
    pub xml: String,
    /// Blocks the validator had to detach.
    pub repairs: Vec<Repair>,
}

#[derive(Debug, Clone)]
pub struct WriteRequest<'a> {
    pub image: &'a Path,
    pub sha256: Option<&'a str>,
    pub verify: bool,
}

#[derive(Debug)]
pub struct WriteOutcome {
    pub state: SessionState,
    pub report: FlashReport,
    pub mountpoint: PathBuf,
    /// Set when the card was written and prepared but cleanup failed.
    pub cleanup_error: Option<BakeryError>,
}

pub struct Session<'a> {
    hal: &'a dyn SystemHal,
    config: &'a BakeryConfig,
    registry: &'a BlockRegistry,
    progress: &'a Progress,
    strategy: Strategy,
    dry_run: bool,
}

impl<'a> Session<'a> {
    pub fn new(
        hal: &'a dyn SystemHal,
        config: &'a BakeryConfig,
        registry: &'a BlockRegistry,
        progress: &'a Progress,
        dry_run: bool,
    ) -> Self {
        Self {
            hal,
            config,
            registry,
            progress,
            strategy: Strategy::for_host(),
            dry_run,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Upgrade, retarget and validate `recipe`, then compile it.
    pub fn prepare(&self, mut recipe: Recipe, mode: InstallMode) -> BakeryResult<PreparedRecipe> {
        let first_boot = mode == InstallMode::Write;
        recipe::upgrade(&mut recipe);
        recipe.retarget_hats(first_boot);
        let mut workspace = recipe.into_workspace();
        let repairs = enforce_validator(&mut workspace, self.registry)?;

        let lines = workspace.to_lines(self.registry)?;
        let bundle = compiler::compile_bundle(&lines, self.registry)?;
        let xml = Recipe::from_workspace(&workspace, first_boot).to_xml()?;
        log::info!(
            "📝 Compiled recipe: {} block(s) referenced",
            bundle.block_names().len()
        );
        Ok(PreparedRecipe {
            bundle,
            xml,
            repairs,
        })
    }

    /// Write `request.image` to `drive`, then install `recipe` on its boot
    /// partition.
    pub fn write(
        &self,
        request: &WriteRequest<'_>,
        drive: Drive,
        recipe: Recipe,
    ) -> BakeryResult<WriteOutcome> {
        log::info!("💾 Writing {} to {}", request.image.display(), drive.device);
        let image = image::prepare_image(request.image, request.sha256, self.progress)?;
        // Compile first so a broken recipe never costs a raw write.
        let prepared = self.prepare(recipe, InstallMode::Write)?;

        let opts = FlashOptions::new(self.dry_run, request.verify);
        let report =
            elevate::write_with_privileges(self.hal, &image, &drive, &opts, self.progress)?;

        let mount = Resolver::new(self.hal, self.config, self.progress, self.dry_run)
            .resolve(&drive, self.strategy)?;
        let state = SessionState {
            drive,
            mode: InstallMode::Write,
            used_manual_mount: mount.manual,
        };

        let installed = self.install(&mount.mountpoint, &prepared, state.mode);
        let cleaned = installer::cleanup(
            self.hal,
            &state.drive,
            &mount.mountpoint,
            state.used_manual_mount,
            self.dry_run,
        );
        if let Err(err) = installed {
            return Err(match cleaned {
                Ok(()) => err,
                Err(cleanup) => with_cleanup_failure(err, cleanup),
            });
        }

        let cleanup_error = cleaned.err();
        if let Some(err) = &cleanup_error {
            log::warn!("⚠️ Card written, but cleanup failed: {err}");
        }
        self.progress.status("SD card written");
        Ok(WriteOutcome {
            state,
            report,
            mountpoint: mount.mountpoint,
            cleanup_error,
        })
    }

    /// Replace the scripts on an already prepared card. No raw write.
    pub fn update(&self, drive: &Drive, recipe: Recipe) -> BakeryResult<PathBuf> {
        log::info!("🔧 Updating {}", drive.device);
        let mountpoint = self
            .mountpoint_with(drive, &self.config.boot_marker)
            .ok_or_else(|| BakeryError::AmbiguousMountpoints {
                device: drive.device.clone(),
                detail: format!("No mountpoint contains {}.", self.config.boot_marker),
            })?;
        let prepared = self.prepare(recipe, InstallMode::Update)?;
        self.install(&mountpoint, &prepared, InstallMode::Update)?;
        self.progress.status("SD card updated");
        Ok(mountpoint)
    }

    /// Read the recipe saved on a prepared card.
    pub fn load(&self, drive: &Drive) -> BakeryResult<Recipe> {
        let mountpoint = self.mountpoint_with(drive, PREPARED_MARKER).ok_or_else(|| {
            BakeryError::Recipe(format!("{} has no {PREPARED_MARKER}", drive.device))
        })?;
        let path = mountpoint.join(PREPARED_MARKER);
        let xml = std::fs::read_to_string(&path)
            .map_err(|e| BakeryError::Recipe(format!("cannot read {}: {e}", path.display())))?;
        let mut recipe = Recipe::parse(&xml)?;
        let upgraded = recipe::upgrade(&mut recipe);
        if upgraded > 0 {
            log::info!("🔧 Applied {upgraded} recipe upgrade(s)");
        }
        Ok(recipe)
    }

    fn mountpoint_with(&self, drive: &Drive, relative: &str) -> Option<PathBuf> {
        drive
            .mountpoints
            .iter()
            .find(|mp| self.hal.file_readable(&mp.join(relative)))
            .cloned()
    }

    fn install(
        &self,
        mountpoint: &Path,
        prepared: &PreparedRecipe,
        mode: InstallMode,
    ) -> BakeryResult<()> {
        installer::install(
            &InstallRequest {
                mountpoint,
                bundle: &prepared.bundle,
                recipe_xml: &prepared.xml,
                resources_dir: &self.config.resources_dir,
                mode,
            },
            self.progress,
            self.dry_run,
        )
    }
}

/// Keep a cleanup failure that followed a failed install next to it.
fn with_cleanup_failure(err: BakeryError, cleanup: BakeryError) -> BakeryError {
    log::error!("❌ Cleanup after the failed install also failed: {cleanup}");
    match err {
        BakeryError::InstallStepFailure { stage, reason, .. } => BakeryError::InstallStepFailure {
            stage,
            reason,
            cleanup: Some(cleanup.to_string()),
        },
        other => other,
    }
}

/// Detach trailing power actions until the every-boot phase no longer ends
/// in one.
fn enforce_validator(
    workspace: &mut Workspace,
    registry: &BlockRegistry,
) -> BakeryResult<Vec<Repair>> {
    let mut repairs = Vec::new();
    let budget: usize = workspace.stacks().iter().map(|s| s.blocks.len()).sum();
    for _ in 0..budget {
        let Some(id) = last_every_boot_block(workspace) else {
            break;
        };
        match validator::validate(workspace, registry, &id)? {
            Some(repair) => repairs.push(repair),
            None => break,
        }
    }
    Ok(repairs)
}

fn last_every_boot_block(workspace: &Workspace) -> Option<String> {
    let mut order: Vec<_> = workspace.stacks().iter().collect();
    order.sort_by_key(|s| (s.y, s.x));
    order
        .into_iter()
        .rev()
        .filter(|s| s.phase() == Some(Phase::EveryBoot))
        .find_map(|s| s.blocks.last())
        .map(|b| b.id.clone())
}

use anyhow::{bail, Context};
use bakery_core::blocks::BlockRegistry;
use bakery_core::cli::{Cli, Command, DriveFilter};
use bakery_core::config::BakeryConfig;
use bakery_core::drives::{self, PREPARED_MARKER, RASPBIAN_MARKER};
use bakery_core::installer::InstallMode;
use bakery_core::phase::Phase;
use bakery_core::progress::{Progress, ProgressUpdate};
use bakery_core::recipe::Recipe;
use bakery_core::session::{Session, WriteRequest};
use bakery_core::{elevate, logging};
use bakery_error::BakeryError;
use bakery_hal::{Drive, FlashOptions, HostHal, SystemHal};
use clap::Parser;
use std::path::Path;
use std::sync::mpsc;

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = BakeryConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init_with(cli.log_file.clone().or_else(|| config.log_file.clone()));
    dispatch(&cli, &config, &HostHal::new())
}

/// User-facing rendering of a failure: title, cause, remedy.
pub fn describe_error(err: &anyhow::Error) -> String {
    match err.chain().find_map(|e| e.downcast_ref::<BakeryError>()) {
        Some(bakery) => format!(
            "❌ {}\nCan't write to SD card, error code {} :: {}\n💡 {}",
            bakery.title(),
            bakery.code(),
            bakery,
            bakery.remedy()
        ),
        None => format!("❌ {err:#}"),
    }
}

pub fn dispatch(cli: &Cli, config: &BakeryConfig, hal: &dyn SystemHal) -> anyhow::Result<()> {
    match &cli.command {
        Command::Compile { recipe } => {
            log::info!("📝 Compiling {}", recipe.display());
            let registry = load_registry(config)?;
            let recipe = read_recipe(recipe)?;
            let mode = match recipe.first_boot {
                Some(false) => InstallMode::Update,
                _ => InstallMode::Write,
            };
            let progress = Progress::silent();
            let session = Session::new(hal, config, &registry, &progress, cli.dry_run);
            let prepared = session.prepare(recipe, mode)?;
            for repair in &prepared.repairs {
                println!("⚠️ {} ({})", repair.message, repair.block_id);
            }
            let scripts = &prepared.bundle.scripts;
            for phase in Phase::ALL {
                println!("==> {} (wait for network: {})", phase.script_name(), scripts.waits_for_network(phase));
                println!("{}", scripts.script(phase));
            }
            println!("==> blocks");
            for (name, folder) in prepared.bundle.blocks() {
                println!("{name}\t{}", folder.display());
            }
        }

        Command::Drives { filter } => {
            log::info!("🔍 Looking for SD cards...");
            list_drives(hal, filter)?;
        }

        Command::Write {
            image,
            device,
            recipe,
            sha256,
            no_verify,
        } => {
            relaunch_if_needed(hal, cli.dry_run);
            let registry = load_registry(config)?;
            let recipe = read_recipe(recipe)?;
            let drive = find_drive(hal, device)?;
            let outcome = with_console_progress(|progress| {
                Session::new(hal, config, &registry, progress, cli.dry_run).write(
                    &WriteRequest {
                        image,
                        sha256: sha256.as_deref(),
                        verify: config.verify_writes && !no_verify,
                    },
                    drive,
                    recipe,
                )
            })?;
            println!(
                "✅ Wrote {} bytes to {} and installed the boot scripts at {}",
                outcome.report.bytes_written,
                outcome.state.drive.device,
                outcome.mountpoint.display()
            );
            if let Some(err) = &outcome.cleanup_error {
                eprintln!("⚠️ {}: {err}\n💡 {}", err.title(), err.remedy());
            }
        }

        Command::Update { device, recipe } => {
            let registry = load_registry(config)?;
            let recipe = read_recipe(recipe)?;
            let drive = find_drive(hal, device)?;
            let mountpoint = with_console_progress(|progress| {
                Session::new(hal, config, &registry, progress, cli.dry_run).update(&drive, recipe)
            })?;
            println!("✅ Updated the boot scripts at {}", mountpoint.display());
        }

        Command::Load { device, out } => {
            let drive = find_drive(hal, device)?;
            let registry = BlockRegistry::new();
            let progress = Progress::silent();
            let recipe = Session::new(hal, config, &registry, &progress, cli.dry_run).load(&drive)?;
            let xml = recipe.to_xml()?;
            match out {
                Some(path) => {
                    std::fs::write(path, &xml)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    log::info!("💾 Saved recipe to {}", path.display());
                }
                None => println!("{xml}"),
            }
        }

        Command::WriteWorker {
            image,
            drive_json,
            socket,
            no_verify,
        } => {
            log::info!("🔧 Elevated writer started");
            elevate::run_worker(
                hal,
                image,
                drive_json,
                socket,
                &FlashOptions::new(cli.dry_run, !no_verify),
            )?;
        }
    }
    Ok(())
}

/// Raw writes need root; updates only touch the mounted boot partition.
fn relaunch_if_needed(hal: &dyn SystemHal, dry_run: bool) {
    if dry_run {
        return;
    }
    if let Some(code) = elevate::relaunch_elevated(hal) {
        std::process::exit(code);
    }
}

fn load_registry(config: &BakeryConfig) -> anyhow::Result<BlockRegistry> {
    BlockRegistry::load(&config.block_dirs, config.fallback_blocks_dir.as_deref())
        .context("Failed to load block packs")
}

fn read_recipe(path: &Path) -> anyhow::Result<Recipe> {
    let xml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read recipe {}", path.display()))?;
    Ok(Recipe::parse(&xml)?)
}

fn find_drive(hal: &dyn SystemHal, device: &str) -> anyhow::Result<Drive> {
    match hal.drive_by_device(device)? {
        Some(drive) if drive.system => bail!("{device} is a system drive; refusing to touch it"),
        Some(drive) if drive.protected => bail!("{device} is write protected"),
        Some(drive) => Ok(drive),
        None => bail!("No drive found at {device}"),
    }
}

fn list_drives(hal: &dyn SystemHal, filter: &DriveFilter) -> anyhow::Result<()> {
    let candidates = drives::candidates(hal)?;
    let marker = if filter.prepared {
        Some(PREPARED_MARKER)
    } else if filter.raspbian {
        Some(RASPBIAN_MARKER)
    } else {
        None
    };
    let rows: Vec<(drives::Candidate, Option<std::path::PathBuf>)> = match marker {
        Some(marker) => drives::drives_with_file(hal, candidates, marker)
            .into_iter()
            .map(|(c, mp)| (c, Some(mp)))
            .collect(),
        None => candidates.into_iter().map(|c| (c, None)).collect(),
    };
    if rows.is_empty() {
        println!("No SD cards found");
    }
    for (candidate, mountpoint) in rows {
        let size_gb = candidate.drive.size as f64 / 1_000_000_000.0;
        match mountpoint {
            Some(mp) => println!(
                "{}\t{}\t{size_gb:.1} GB\t{}",
                candidate.drive.device,
                candidate.name,
                mp.display()
            ),
            None => println!("{}\t{}\t{size_gb:.1} GB", candidate.drive.device, candidate.name),
        }
    }
    Ok(())
}

/// Run `work` while a background thread prints its progress.
fn with_console_progress<T>(work: impl FnOnce(&Progress) -> T) -> T {
    let (tx, rx) = mpsc::channel::<ProgressUpdate>();
    let printer = std::thread::spawn(move || {
        let mut last_percent = None;
        for update in rx {
            match &update {
                ProgressUpdate::Bytes { .. } => {
                    let percent = update.percent();
                    if percent != last_percent {
                        if let Some(p) = percent {
                            eprint!("\r💾 {p:>3}%");
                            if p == 100 {
                                eprintln!();
                            }
                        }
                        last_percent = percent;
                    }
                }
                ProgressUpdate::StageStarted(name) => log::debug!("▶ {name}"),
                ProgressUpdate::StageCompleted(name) => log::debug!("✔ {name}"),
                // Already logged by Progress::status.
                ProgressUpdate::Status(_) => {}
            }
        }
    });
    let progress = Progress::new(tx);
    let result = work(&progress);
    drop(progress);
    let _ = printer.join();
    result
}

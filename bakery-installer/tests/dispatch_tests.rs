use bakery_core::cli::Cli;
use bakery_core::config::BakeryConfig;
use bakery_error::BakeryError;
use bakery_hal::{Drive, FakeHal, Operation};
use bakery_installer::{describe_error, dispatch};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn setup(dir: &Path) -> (BakeryConfig, PathBuf) {
    let pack = dir.join("blocks");
    fs::create_dir_all(pack.join("update")).unwrap();
    fs::write(pack.join("info.json"), r#"{"loadOrder": ["update"]}"#).unwrap();
    fs::write(
        pack.join("update/update.json"),
        r#"{"name": "update", "script": "update.sh", "network": true}"#,
    )
    .unwrap();

    let resources = dir.join("resources");
    fs::create_dir_all(resources.join("pibakery-raspbian")).unwrap();
    for file in ["busybox", "pibakery-mount.sh", "pibakery-install.sh"] {
        fs::write(resources.join(file), file).unwrap();
    }

    let boot = dir.join("boot");
    fs::create_dir_all(&boot).unwrap();
    fs::write(boot.join("bootcode.bin"), b"").unwrap();
    fs::write(boot.join("cmdline.txt"), "root=/dev/mmcblk0p2 rootwait").unwrap();

    let config = BakeryConfig {
        resources_dir: resources,
        block_dirs: vec![pack],
        ..BakeryConfig::default()
    };
    (config, boot)
}

#[test]
fn update_installs_next_boot_scripts_on_the_card() {
    let dir = TempDir::new().expect("temp dir");
    let (config, boot) = setup(dir.path());
    let recipe = dir.path().join("recipe.xml");
    fs::write(
        &recipe,
        r#"<xml><block type="onfirstboot" id="h" x="0" y="0"><next><block type="update" id="u"></block></next></block></xml>"#,
    )
    .unwrap();
    let hal = FakeHal::new()
        .with_drives(vec![Drive::new("/dev/sdz", 8 << 30).with_mountpoints([boot.clone()])]);

    let cli = Cli::try_parse_from([
        "bakery",
        "update",
        "--device",
        "/dev/sdz",
        "--recipe",
        recipe.to_str().unwrap(),
    ])
    .unwrap();
    dispatch(&cli, &config, &hal).expect("update");

    let root = boot.join("PiBakery");
    assert!(root.join("runNextBoot").is_file());
    assert!(root.join("waitForNetworkNextBoot").is_file());
    assert!(fs::read_to_string(root.join("nextBoot.sh"))
        .unwrap()
        .contains("/boot/PiBakery/blocks/update/update.sh"));
    assert!(!hal.has_operation(|op| matches!(op, Operation::FlashImage { .. })));
}

#[test]
fn load_writes_the_saved_recipe() {
    let dir = TempDir::new().expect("temp dir");
    let (config, boot) = setup(dir.path());
    fs::create_dir_all(boot.join("PiBakery")).unwrap();
    fs::write(
        boot.join("PiBakery/blocks.xml"),
        r#"<xml><block type="onboot" id="h" x="0" y="0"><next><block type="vncstart" id="v"></block></next></block><firstboot>1</firstboot></xml>"#,
    )
    .unwrap();
    let hal = FakeHal::new()
        .with_drives(vec![Drive::new("/dev/sdz", 8 << 30).with_mountpoints([boot.clone()])]);
    let out = dir.path().join("loaded.xml");

    let cli = Cli::try_parse_from([
        "bakery",
        "load",
        "--device",
        "/dev/sdz",
        "--out",
        out.to_str().unwrap(),
    ])
    .unwrap();
    dispatch(&cli, &config, &hal).expect("load");

    let saved = fs::read_to_string(&out).unwrap();
    assert!(saved.contains("vncenable"));
    assert!(!saved.contains("vncstart"));
}

#[test]
fn system_drives_are_refused() {
    let dir = TempDir::new().expect("temp dir");
    let (config, _) = setup(dir.path());
    let mut system = Drive::new("/dev/sda", 500 << 30).with_mountpoints(["/"]);
    system.system = true;
    let hal = FakeHal::new().with_drives(vec![system]);

    let cli = Cli::try_parse_from(["bakery", "load", "--device", "/dev/sda"]).unwrap();
    let err = dispatch(&cli, &config, &hal).unwrap_err();
    assert!(err.to_string().contains("system drive"));
}

#[test]
fn errors_are_described_with_code_and_remedy() {
    let err = anyhow::Error::new(BakeryError::ImageTooSmall {
        device_size: 1,
        image_size: 2,
    });
    let text = describe_error(&err);
    assert!(text.contains("SD card too small"));
    assert!(text.contains("error code SD_TOO_SMALL ::"));
    assert!(text.contains("Use a larger card."));
}

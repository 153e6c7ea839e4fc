//! CLI argument parsing for bakery

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bakery")]
#[command(about = "🥧 bakery - boot scripts and SD cards for Raspberry Pi")]
#[command(long_about = "🥧 bakery - boot scripts and SD cards for Raspberry Pi\n\n\
    Compiles a block recipe into first-boot, next-boot and every-boot scripts,\n\
    writes a Raspbian image to an SD card and installs the scripts on its\n\
    boot partition.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to $BAKERY_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Run in dry-run mode (no changes made)
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
#[group(multiple = false)]
pub struct DriveFilter {
    /// Only cards that already carry bakery scripts
    #[arg(long)]
    pub prepared: bool,

    /// Only cards with a Raspbian boot partition
    #[arg(long)]
    pub raspbian: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 📝 Compile a recipe and print the three boot scripts
    Compile {
        /// Recipe exported as XML
        #[arg(long)]
        recipe: PathBuf,
    },

    /// 🔍 List removable drives
    Drives {
        #[command(flatten)]
        filter: DriveFilter,
    },

    /// 💾 Write an image to an SD card and install a recipe on it
    Write {
        /// Raspbian image (.img or .img.xz)
        #[arg(long)]
        image: PathBuf,

        /// Target device (e.g. /dev/sdb, /dev/disk2)
        #[arg(long)]
        device: String,

        #[arg(long)]
        recipe: PathBuf,

        /// Expected SHA-256 of the image file
        #[arg(long)]
        sha256: Option<String>,

        /// Skip reading the card back after writing
        #[arg(long)]
        no_verify: bool,
    },

    /// 🔧 Replace the scripts on an already written card
    Update {
        #[arg(long)]
        device: String,

        #[arg(long)]
        recipe: PathBuf,
    },

    /// 📦 Read the recipe back from a prepared card
    Load {
        #[arg(long)]
        device: String,

        /// Write the recipe here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Elevated raw writer, started by bakery itself
    #[command(hide = true)]
    WriteWorker {
        #[arg(long)]
        image: PathBuf,

        #[arg(long)]
        drive_json: String,

        #[arg(long)]
        socket: String,

        #[arg(long)]
        no_verify: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_takes_global_flags_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "bakery",
            "write",
            "--image",
            "raspbian.img.xz",
            "--device",
            "/dev/sdb",
            "--recipe",
            "recipe.xml",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.dry_run);
        match cli.command {
            Command::Write {
                device, no_verify, ..
            } => {
                assert_eq!(device, "/dev/sdb");
                assert!(!no_verify);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn drive_filters_are_exclusive() {
        assert!(Cli::try_parse_from(["bakery", "drives", "--prepared", "--raspbian"]).is_err());
        assert!(Cli::try_parse_from(["bakery", "drives", "--raspbian"]).is_ok());
    }

    #[test]
    fn worker_subcommand_parses_its_channel() {
        let cli = Cli::try_parse_from([
            "bakery",
            "write-worker",
            "--image",
            "/tmp/a.img",
            "--drive-json",
            "{}",
            "--socket",
            "tcp:127.0.0.1:4000",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::WriteWorker { .. }));
    }
}

//! Privileged raw writes.
//!
//! On macOS, when the process cannot open raw devices itself, the write runs
//! in a short-lived copy of this binary started through an `osascript`
//! administrator prompt and reporting back over an [`ipc`](crate::ipc)
//! channel. On Linux the whole program is relaunched through `pkexec` up
//! front instead; a write without root then fails straight away.

use crate::ipc::{Liveness, MessageSender, WorkerMessage, WriterChannel};
use crate::progress::{Progress, ProgressUpdate};
use crate::writer;
use bakery_error::{BakeryError, BakeryResult};
use bakery_hal::{Drive, FlashOptions, FlashReport, SystemHal};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;

/// Hidden subcommand the worker is started with.
pub const WORKER_COMMAND: &str = "write-worker";
/// Set in the environment of a relaunched process so it never relaunches again.
pub const RELAUNCHED_ENV: &str = "BAKERY_RELAUNCHED";

/// What the worker needs to perform one write.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub image: PathBuf,
    pub drive: Drive,
    pub verify: bool,
}

impl WorkerRequest {
    pub fn args(&self, address: &str) -> BakeryResult<Vec<String>> {
        let drive_json = serde_json::to_string(&self.drive)
            .map_err(|e| BakeryError::Ipc(format!("cannot encode drive: {e}")))?;
        let mut args = vec![
            WORKER_COMMAND.to_string(),
            "--image".to_string(),
            self.image.display().to_string(),
            "--drive-json".to_string(),
            drive_json,
            "--socket".to_string(),
            address.to_string(),
        ];
        if !self.verify {
            args.push("--no-verify".to_string());
        }
        Ok(args)
    }
}

/// POSIX single-quoting.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// AppleScript that runs `exe args` with an administrator prompt.
pub fn applescript(exe: &Path, args: &[String]) -> String {
    let line = std::iter::once(exe.display().to_string())
        .chain(args.iter().cloned())
        .map(|a| shell_quote(&a))
        .collect::<Vec<_>>()
        .join(" ");
    let escaped = line.replace('\\', r"\\").replace('"', r#"\""#);
    format!("do shell script \"{escaped}\" with administrator privileges")
}

/// Only macOS starts a separate elevated writer; elsewhere the caller must
/// already be privileged.
fn ensure_worker_supported() -> BakeryResult<()> {
    if cfg!(target_os = "macos") {
        Ok(())
    } else if cfg!(target_os = "linux") {
        Err(BakeryError::Elevation(
            "administrator rights were not granted; accept the pkexec prompt or run bakery as root"
                .to_string(),
        ))
    } else {
        Err(BakeryError::Elevation(
            "raw writes are not supported on this platform".to_string(),
        ))
    }
}

/// Command that starts `exe args` with an administrator prompt.
pub fn elevated_command(exe: &Path, args: &[String]) -> BakeryResult<Command> {
    ensure_worker_supported()?;
    let mut cmd = Command::new("osascript");
    cmd.arg("-e").arg(applescript(exe, args));
    Ok(cmd)
}

/// Relaunch the whole program through `pkexec` (Linux).
///
/// Returns the relaunched program's exit code, or `None` when the relaunch
/// was not needed, declined or could not start. The caller then carries on
/// and [`write_with_privileges`] refuses the write without prompting again.
pub fn relaunch_elevated(hal: &dyn SystemHal) -> Option<i32> {
    if !cfg!(target_os = "linux")
        || hal.is_elevated()
        || std::env::var_os(RELAUNCHED_ENV).is_some()
    {
        return None;
    }
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            log::warn!("⚠️ Cannot locate the running binary: {err}");
            return None;
        }
    };
    let args: Vec<String> = std::env::args().skip(1).collect();
    log::info!("🔧 Relaunching with administrator rights");
    match Command::new("pkexec")
        .arg("env")
        .arg(format!("{RELAUNCHED_ENV}=1"))
        .arg(&exe)
        .args(&args)
        .status()
    {
        // pkexec exits 126/127 when the prompt was dismissed or refused.
        Ok(status) if matches!(status.code(), Some(126) | Some(127)) => {
            log::warn!("⚠️ Elevation declined; writing to SD cards will fail");
            None
        }
        Ok(status) => Some(status.code().unwrap_or(1)),
        Err(err) => {
            log::warn!("⚠️ Could not run pkexec: {err}");
            None
        }
    }
}

/// Write `image` to `drive`, in process when already privileged, else
/// through an elevated worker.
pub fn write_with_privileges(
    hal: &dyn SystemHal,
    image: &Path,
    drive: &Drive,
    opts: &FlashOptions,
    progress: &Progress,
) -> BakeryResult<FlashReport> {
    if hal.is_elevated() || opts.dry_run {
        return writer::write_image(hal, image, drive, opts, progress);
    }

    ensure_worker_supported()?;

    let request = WorkerRequest {
        image: image.to_path_buf(),
        drive: drive.clone(),
        verify: opts.verify,
    };
    let exe = std::env::current_exe()
        .map_err(|e| BakeryError::Elevation(format!("cannot locate the running binary: {e}")))?;
    let channel = WriterChannel::create()?;
    let args = request.args(channel.address())?;

    progress.status("Requesting administrator rights...");
    let child = elevated_command(&exe, &args)?
        .spawn()
        .map_err(|e| BakeryError::Elevation(e.to_string()))?;
    progress.status(writer::STATUS_WRITING);
    relay(channel, child, progress)
}

/// Forward worker messages to `progress` until the worker finishes.
pub fn relay(
    channel: WriterChannel,
    mut peer: impl Liveness,
    progress: &Progress,
) -> BakeryResult<FlashReport> {
    let mut reader = channel.accept(&mut peer)?;
    loop {
        match reader.recv()? {
            Some(WorkerMessage::WriteProgress {
                transferred,
                length,
            }) => progress.bytes(transferred, length),
            Some(WorkerMessage::WriteError { name, message }) => {
                log::error!("❌ Writer reported {name}: {message}");
                return Err(BakeryError::Worker {
                    code: name,
                    message,
                });
            }
            Some(WorkerMessage::WriteDone {
                bytes_written,
                sha256,
            }) => {
                return Ok(FlashReport {
                    bytes_written,
                    sha256,
                })
            }
            None => {
                return Err(BakeryError::Ipc(
                    "the writer exited without reporting a result".to_string(),
                ))
            }
        }
    }
}

/// Body of the elevated worker: write, streaming progress to `address`.
pub fn run_worker(
    hal: &dyn SystemHal,
    image: &Path,
    drive_json: &str,
    address: &str,
    opts: &FlashOptions,
) -> BakeryResult<FlashReport> {
    let mut sender = MessageSender::connect(address)?;
    let drive: Drive = match serde_json::from_str(drive_json) {
        Ok(drive) => drive,
        Err(e) => {
            let err = BakeryError::Ipc(format!("malformed drive description: {e}"));
            sender.send(&WorkerMessage::from_error(&err))?;
            return Err(err);
        }
    };

    let (tx, rx) = mpsc::channel();
    let result = std::thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let progress = Progress::new(tx);
            writer::write_image(hal, image, &drive, opts, &progress)
        });
        for update in rx {
            if let ProgressUpdate::Bytes {
                transferred,
                length,
            } = update
            {
                let message = WorkerMessage::WriteProgress {
                    transferred,
                    length,
                };
                if let Err(err) = sender.send(&message) {
                    log::warn!("⚠️ {err}");
                }
            }
        }
        handle
            .join()
            .unwrap_or_else(|_| Err(BakeryError::Ipc("the write thread panicked".to_string())))
    });

    match &result {
        Ok(report) => sender.send(&WorkerMessage::WriteDone {
            bytes_written: report.bytes_written,
            sha256: report.sha256.clone(),
        })?,
        Err(err) => sender.send(&WorkerMessage::from_error(err))?,
    }
    result
}

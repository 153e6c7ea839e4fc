//! Progress reporting for long-running pipeline steps.

use std::sync::mpsc::Sender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// Human-readable status line.
    Status(String),
    /// Raw write progress.
    Bytes { transferred: u64, length: u64 },
    StageStarted(String),
    StageCompleted(String),
}

impl ProgressUpdate {
    /// Whole percent of a byte update, if it is one.
    pub fn percent(&self) -> Option<u8> {
        match self {
            ProgressUpdate::Bytes { transferred, length } if *length > 0 => {
                Some(((*transferred).min(*length) * 100 / *length) as u8)
            }
            _ => None,
        }
    }
}

/// Optional progress sink.
///
/// Closing the receiving side (dismissing the progress dialog) never aborts
/// the work; later updates are dropped.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    tx: Option<Sender<ProgressUpdate>>,
}

impl Progress {
    pub fn new(tx: Sender<ProgressUpdate>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn send(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(update);
        }
    }

    /// Log `msg` and forward it as a status line.
    pub fn status(&self, msg: &str) {
        log::info!("{msg}");
        self.send(ProgressUpdate::Status(msg.to_string()));
    }

    pub fn bytes(&self, transferred: u64, length: u64) {
        self.send(ProgressUpdate::Bytes {
            transferred,
            length,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn dropped_receiver_is_ignored() {
        let (tx, rx) = mpsc::channel();
        let progress = Progress::new(tx);
        progress.status("Writing IMG to SD card...");
        assert_eq!(
            rx.recv().unwrap(),
            ProgressUpdate::Status("Writing IMG to SD card...".into())
        );
        drop(rx);
        progress.bytes(1, 2);
    }

    #[test]
    fn percent_is_clamped() {
        let update = ProgressUpdate::Bytes {
            transferred: 150,
            length: 100,
        };
        assert_eq!(update.percent(), Some(100));
        let empty = ProgressUpdate::Bytes {
            transferred: 0,
            length: 0,
        };
        assert_eq!(empty.percent(), None);
    }
}

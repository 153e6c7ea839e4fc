//! Boot phases and the on-card names tied to them.

use serde::{Deserialize, Serialize};

/// One of the three boot-time execution contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    EveryBoot,
    FirstBoot,
    NextBoot,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::EveryBoot, Phase::FirstBoot, Phase::NextBoot];

    pub fn index(self) -> usize {
        match self {
            Phase::EveryBoot => 0,
            Phase::FirstBoot => 1,
            Phase::NextBoot => 2,
        }
    }

    /// Sentinel line emitted by the phase's hat block.
    pub fn marker(self) -> &'static str {
        match self {
            Phase::EveryBoot => "_pibakery-oneveryboot",
            Phase::FirstBoot => "_pibakery-onfirstboot",
            Phase::NextBoot => "_pibakery-onnextboot",
        }
    }

    pub fn from_marker(line: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.marker() == line)
    }

    /// Recipe block type of the hat that starts this phase.
    pub fn hat_type(self) -> &'static str {
        match self {
            Phase::EveryBoot => "onboot",
            Phase::FirstBoot => "onfirstboot",
            Phase::NextBoot => "onnextboot",
        }
    }

    pub fn from_hat_type(kind: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.hat_type() == kind)
    }

    /// Human-readable name used in gauge captions.
    pub fn label(self) -> &'static str {
        match self {
            Phase::EveryBoot => "Every Boot",
            Phase::FirstBoot => "First Boot",
            Phase::NextBoot => "Next Boot",
        }
    }

    /// Suffix used for per-phase enabler files (`waitForNetworkEveryBoot`).
    pub fn enabler_suffix(self) -> &'static str {
        match self {
            Phase::EveryBoot => "EveryBoot",
            Phase::FirstBoot => "FirstBoot",
            Phase::NextBoot => "NextBoot",
        }
    }

    pub fn script_name(self) -> &'static str {
        match self {
            Phase::EveryBoot => "everyBoot.sh",
            Phase::FirstBoot => "firstBoot.sh",
            Phase::NextBoot => "nextBoot.sh",
        }
    }

    /// Append-only log on the device that block output is redirected to.
    pub fn log_file(self) -> &'static str {
        match self {
            Phase::EveryBoot => "/boot/PiBakery/everyboot.log",
            Phase::FirstBoot => "/boot/PiBakery/firstboot.log",
            Phase::NextBoot => "/boot/PiBakery/nextboot.log",
        }
    }
}

//! Structural check run after every workspace edit.
//!
//! An every-boot sequence that ends by powering the device off or rebooting
//! it would loop forever, so the block that produced that state is detached.

use crate::blocks::BlockRegistry;
use crate::graph::Workspace;
use crate::phase::Phase;
use bakery_error::BakeryResult;

/// Invocations that may not end the every-boot phase.
pub const TERMINAL_ACTIONS: [&str; 2] = [
    "/boot/PiBakery/blocks/shutdown/shutdown.sh",
    "/boot/PiBakery/blocks/reboot/reboot.sh",
];

pub const REJECTED_PLACEMENT: &str = "You can't put that block there.";

/// Outcome of a validation pass that had to repair the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    pub block_id: String,
    pub message: &'static str,
}

/// The every-boot step lines, tab removed, in flattening order.
pub fn every_boot_body<S: AsRef<str>>(lines: &[S]) -> Vec<&str> {
    let mut body = Vec::new();
    let mut phase = None;
    let mut expect_marker = true;
    for line in lines.iter().map(AsRef::as_ref) {
        if let Some(step) = line.strip_prefix('\t') {
            if !expect_marker && phase == Some(Phase::EveryBoot) {
                body.push(step);
            }
        } else if let Some(marker) = Phase::from_marker(line) {
            phase = Some(marker);
            expect_marker = false;
        } else if line.is_empty() {
            expect_marker = true;
        }
    }
    body
}

pub fn ends_with_terminal_action<S: AsRef<str>>(lines: &[S]) -> bool {
    every_boot_body(lines)
        .last()
        .is_some_and(|last| TERMINAL_ACTIONS.contains(last))
}

/// Validate `workspace` after `modified_id` was moved or edited.
///
/// When the every-boot phase now ends in a terminal action, `modified_id` is
/// detached and a [`Repair`] describing it is returned.
pub fn validate(
    workspace: &mut Workspace,
    registry: &BlockRegistry,
    modified_id: &str,
) -> BakeryResult<Option<Repair>> {
    let lines = workspace.to_lines(registry)?;
    if !ends_with_terminal_action(&lines) {
        return Ok(None);
    }
    log::warn!("⚠️ Every-boot phase ends in a power action; detaching {modified_id}");
    workspace.detach(modified_id);
    Ok(Some(Repair {
        block_id: modified_id.to_string(),
        message: REJECTED_PLACEMENT,
    }))
}

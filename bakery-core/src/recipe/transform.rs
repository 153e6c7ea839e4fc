//! Upgrades for recipes saved by older block packs.

use super::{Recipe, RecipeBlock};

/// Country code given to wifi blocks saved before the field existed.
const DEFAULT_WIFI_COUNTRY: &str = "GB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upgrade {
    /// `wifisetup` gains a country field.
    WifiCountry,
    /// `vncserver` is gone; VNC ships with the OS now.
    DropVncServer,
    /// `vncstart` became `vncenable`.
    RenameVncStart,
}

fn needed(block: &RecipeBlock) -> Option<Upgrade> {
    match block.kind.as_str() {
        "wifisetup" if block.field("4").is_none() => Some(Upgrade::WifiCountry),
        "vncserver" => Some(Upgrade::DropVncServer),
        "vncstart" => Some(Upgrade::RenameVncStart),
        _ => None,
    }
}

/// Apply legacy upgrades one at a time until none matches. Returns how many
/// were applied.
pub fn upgrade(recipe: &mut Recipe) -> usize {
    let mut applied = 0;
    loop {
        let found = recipe.stacks.iter().enumerate().find_map(|(si, stack)| {
            stack
                .blocks
                .iter()
                .position(|b| needed(b).is_some())
                .map(|bi| (si, bi))
        });
        let Some((si, bi)) = found else {
            break;
        };

        let stack = &mut recipe.stacks[si];
        let block = &mut stack.blocks[bi];
        match needed(block) {
            Some(Upgrade::WifiCountry) => block.set_field("4", DEFAULT_WIFI_COUNTRY),
            Some(Upgrade::RenameVncStart) => {
                block.kind = "vncenable".to_string();
                match block.fields.first_mut() {
                    Some((_, value)) => *value = "Enable".to_string(),
                    None => block.set_field("1", "Enable"),
                }
            }
            Some(Upgrade::DropVncServer) => {
                stack.blocks.remove(bi);
                if stack.blocks.is_empty() {
                    recipe.stacks.remove(si);
                }
            }
            None => break,
        }
        applied += 1;
    }
    if applied > 0 {
        log::info!("🔧 Upgraded {applied} legacy block(s) in recipe");
    }
    applied
}

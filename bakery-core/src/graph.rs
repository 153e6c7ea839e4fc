//! The block workspace: stacks of placed blocks, optionally under a phase hat.

use crate::blocks::{BlockRegistry, FieldValues};
use crate::phase::Phase;
use bakery_error::{BakeryError, BakeryResult};

/// Distance a detached stack is moved away from its old parent.
pub const NUDGE: i64 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInstance {
    pub id: String,
    /// Block definition name.
    pub kind: String,
    pub fields: FieldValues,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hat {
    pub id: String,
    pub phase: Phase,
}

/// A top-level chain of blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub hat: Option<Hat>,
    pub x: i64,
    pub y: i64,
    pub blocks: Vec<BlockInstance>,
}

impl Stack {
    pub fn new(hat: Option<Hat>, x: i64, y: i64) -> Self {
        Self {
            hat,
            x,
            y,
            blocks: Vec::new(),
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        self.hat.as_ref().map(|h| h.phase)
    }

    /// Id of the top block, hat included.
    pub fn top_id(&self) -> Option<&str> {
        self.hat
            .as_ref()
            .map(|h| h.id.as_str())
            .or_else(|| self.blocks.first().map(|b| b.id.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workspace {
    stacks: Vec<Stack>,
    next_id: u64,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stacks(stacks: Vec<Stack>) -> Self {
        Self { stacks, next_id: 0 }
    }

    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    fn fresh_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let id = format!("b{}", self.next_id);
            if !self.contains(&id) {
                return id;
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.stacks.iter().any(|s| {
            s.hat.as_ref().is_some_and(|h| h.id == id) || s.blocks.iter().any(|b| b.id == id)
        })
    }

    /// Add a stack topped by a phase hat and return the hat id.
    pub fn add_hat(&mut self, phase: Phase, x: i64, y: i64) -> String {
        let id = self.fresh_id();
        self.stacks.push(Stack::new(
            Some(Hat {
                id: id.clone(),
                phase,
            }),
            x,
            y,
        ));
        id
    }

    /// Create an unplaced instance of `kind` with default field values.
    pub fn new_block(&mut self, registry: &BlockRegistry, kind: &str) -> BakeryResult<BlockInstance> {
        let definition = registry
            .get(kind)
            .ok_or_else(|| BakeryError::UnknownBlock(kind.to_string()))?;
        Ok(BlockInstance {
            id: self.fresh_id(),
            kind: kind.to_string(),
            fields: definition.default_fields(),
        })
    }

    /// Place `block` as a new loose stack.
    pub fn add_loose(&mut self, block: BlockInstance, x: i64, y: i64) {
        let mut stack = Stack::new(None, x, y);
        stack.blocks.push(block);
        self.stacks.push(stack);
    }

    /// Stack index and chain position of `id`. Hats report no position.
    pub fn locate(&self, id: &str) -> Option<(usize, Option<usize>)> {
        self.stacks.iter().enumerate().find_map(|(si, s)| {
            if s.hat.as_ref().is_some_and(|h| h.id == id) {
                return Some((si, None));
            }
            s.blocks
                .iter()
                .position(|b| b.id == id)
                .map(|pos| (si, Some(pos)))
        })
    }

    pub fn block(&self, id: &str) -> Option<&BlockInstance> {
        self.stacks
            .iter()
            .flat_map(|s| s.blocks.iter())
            .find(|b| b.id == id)
    }

    /// Connect `block` directly below `parent_id` (a hat or a block).
    ///
    /// Refused when the parent's definition does not allow successors, or
    /// when `block` itself does not continue but would gain a successor.
    pub fn attach(
        &mut self,
        registry: &BlockRegistry,
        parent_id: &str,
        block: BlockInstance,
    ) -> BakeryResult<()> {
        let (si, pos) = self
            .locate(parent_id)
            .ok_or_else(|| BakeryError::Block(format!("no block with id '{parent_id}'")))?;
        let insert_at = match pos {
            Some(pos) => {
                let parent = &self.stacks[si].blocks[pos];
                if !continues(registry, &parent.kind)? {
                    return Err(BakeryError::Block(format!(
                        "nothing can follow a '{}' block",
                        parent.kind
                    )));
                }
                pos + 1
            }
            None => 0,
        };
        if insert_at < self.stacks[si].blocks.len() && !continues(registry, &block.kind)? {
            return Err(BakeryError::Block(format!(
                "a '{}' block must be last",
                block.kind
            )));
        }
        self.stacks[si].blocks.insert(insert_at, block);
        Ok(())
    }

    /// Split `id` and everything below it into a loose stack nudged away from
    /// its old parent. Returns the new stack's index, or `None` when `id` has
    /// no parent to leave.
    pub fn detach(&mut self, id: &str) -> Option<usize> {
        let (si, pos) = self.locate(id)?;
        let pos = pos?;
        let stack = &mut self.stacks[si];
        if pos == 0 && stack.hat.is_none() {
            return None;
        }
        let tail = stack.blocks.split_off(pos);
        let offset = (pos as i64 + 1) * NUDGE;
        let (x, y) = (stack.x + NUDGE, stack.y + offset);
        log::debug!("Detached {} block(s) starting at {}", tail.len(), id);
        self.stacks.push(Stack {
            hat: None,
            x,
            y,
            blocks: tail,
        });
        Some(self.stacks.len() - 1)
    }

    /// Set a field, sanitised by the block's argument spec. Returns the value stored.
    pub fn set_field(
        &mut self,
        registry: &BlockRegistry,
        id: &str,
        field: &str,
        value: &str,
    ) -> BakeryResult<String> {
        let block = self
            .stacks
            .iter_mut()
            .flat_map(|s| s.blocks.iter_mut())
            .find(|b| b.id == id)
            .ok_or_else(|| BakeryError::Block(format!("no block with id '{id}'")))?;
        let definition = registry
            .get(&block.kind)
            .ok_or_else(|| BakeryError::UnknownBlock(block.kind.clone()))?;
        let clean = definition.sanitize_field(field, value);
        block.fields.insert(field.to_string(), clean.clone());
        Ok(clean)
    }

    /// Flatten to instruction lines, top-most stack first.
    ///
    /// Each stack contributes its hat marker, the generated lines of its
    /// chain, then a blank separator.
    pub fn to_lines(&self, registry: &BlockRegistry) -> BakeryResult<Vec<String>> {
        let mut order: Vec<&Stack> = self.stacks.iter().collect();
        order.sort_by_key(|s| (s.y, s.x));

        let mut lines = Vec::new();
        for stack in order {
            if let Some(hat) = &stack.hat {
                lines.push(hat.phase.marker().to_string());
            }
            for block in &stack.blocks {
                let definition = registry
                    .get(&block.kind)
                    .ok_or_else(|| BakeryError::UnknownBlock(block.kind.clone()))?;
                lines.extend(definition.generate(&block.fields));
            }
            lines.push(String::new());
        }
        Ok(lines)
    }
}

fn continues(registry: &BlockRegistry, kind: &str) -> BakeryResult<bool> {
    registry
        .get(kind)
        .map(|d| d.continues)
        .ok_or_else(|| BakeryError::UnknownBlock(kind.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blocks::BlockDefinition;
    use std::path::PathBuf;

    pub(crate) fn registry() -> BlockRegistry {
        let mut registry = BlockRegistry::new();
        for json in [
            r#"{"name": "wifisetup", "script": "wifiConnect.py",
                "args": [{"type": "text", "default": "net"}, {"type": "text"},
                         {"type": "menu", "options": ["WPA/WPA2", "WEP"]},
                         {"type": "text", "default": "GB", "maxLength": 2}]}"#,
            r#"{"name": "update", "script": "update.sh", "network": true}"#,
            r#"{"name": "hostname", "script": "hostname.sh",
                "args": [{"type": "text", "default": "raspberrypi", "maxLength": 8}]}"#,
            r#"{"name": "reboot", "script": "reboot.sh", "continue": false}"#,
            r#"{"name": "shutdown", "script": "shutdown.sh", "continue": false}"#,
        ] {
            let def: BlockDefinition = serde_json::from_str(json).unwrap();
            let folder = PathBuf::from("/packs/base").join(&def.name);
            registry.insert(def, folder);
        }
        registry
    }

    #[test]
    fn flattening_orders_stacks_top_down() {
        let reg = registry();
        let mut ws = Workspace::new();
        let first = ws.add_hat(Phase::FirstBoot, 0, 200);
        let every = ws.add_hat(Phase::EveryBoot, 0, 10);
        let update = ws.new_block(&reg, "update").unwrap();
        ws.attach(&reg, &first, update).unwrap();
        let host = ws.new_block(&reg, "hostname").unwrap();
        ws.attach(&reg, &every, host).unwrap();

        let lines = ws.to_lines(&reg).unwrap();
        assert_eq!(
            lines,
            vec![
                "_pibakery-oneveryboot",
                "\tchmod 755 /boot/PiBakery/blocks/hostname/hostname.sh",
                "\t/boot/PiBakery/blocks/hostname/hostname.sh raspberrypi",
                "",
                "_pibakery-onfirstboot",
                "\tchmod 755 /boot/PiBakery/blocks/update/update.sh",
                "\t/boot/PiBakery/blocks/update/update.sh",
                "\tNETWORK=True",
                "",
            ]
        );
    }

    #[test]
    fn nothing_attaches_below_a_terminal_block() {
        let reg = registry();
        let mut ws = Workspace::new();
        let hat = ws.add_hat(Phase::NextBoot, 0, 0);
        let reboot = ws.new_block(&reg, "reboot").unwrap();
        let reboot_id = reboot.id.clone();
        ws.attach(&reg, &hat, reboot).unwrap();

        let update = ws.new_block(&reg, "update").unwrap();
        assert!(ws.attach(&reg, &reboot_id, update.clone()).is_err());
        // Inserting above the terminal block is fine.
        ws.attach(&reg, &hat, update).unwrap();
        assert_eq!(ws.stacks()[0].blocks.len(), 2);

        // But a terminal block cannot be wedged into the middle.
        let shutdown = ws.new_block(&reg, "shutdown").unwrap();
        assert!(ws.attach(&reg, &hat, shutdown).is_err());
    }

    #[test]
    fn detach_moves_the_tail_to_a_nudged_loose_stack() {
        let reg = registry();
        let mut ws = Workspace::new();
        let hat = ws.add_hat(Phase::EveryBoot, 100, 100);
        let host = ws.new_block(&reg, "hostname").unwrap();
        let host_id = host.id.clone();
        ws.attach(&reg, &hat, host).unwrap();
        let reboot = ws.new_block(&reg, "reboot").unwrap();
        let reboot_id = reboot.id.clone();
        ws.attach(&reg, &host_id, reboot).unwrap();

        let index = ws.detach(&reboot_id).unwrap();
        let loose = &ws.stacks()[index];
        assert!(loose.hat.is_none());
        assert_eq!(loose.blocks[0].id, reboot_id);
        assert!(loose.x > 100 && loose.y > 100);
        assert_eq!(ws.stacks()[0].blocks.len(), 1);

        // A loose stack's first block has nothing to leave.
        assert_eq!(ws.detach(&reboot_id), None);
        assert_eq!(ws.detach(&hat), None);
    }

    #[test]
    fn set_field_sanitises() {
        let reg = registry();
        let mut ws = Workspace::new();
        let hat = ws.add_hat(Phase::EveryBoot, 0, 0);
        let host = ws.new_block(&reg, "hostname").unwrap();
        let id = host.id.clone();
        ws.attach(&reg, &hat, host).unwrap();

        let stored = ws.set_field(&reg, &id, "1", "averyverylongname").unwrap();
        assert_eq!(stored, "averyver");
        assert_eq!(ws.block(&id).unwrap().fields["1"], "averyver");
    }

    #[test]
    fn loose_stacks_compile_to_nothing() {
        let reg = registry();
        let mut ws = Workspace::new();
        let update = ws.new_block(&reg, "update").unwrap();
        ws.add_loose(update, 0, 0);
        let out = crate::compiler::compile(&ws.to_lines(&reg).unwrap());
        assert!(out.block_names.is_empty());
    }
}

//! Loading block packs from disk.
//!
//! A pack directory holds `info.json` (`{"loadOrder": [...]}`), an optional
//! `categories.json`, and one folder per block containing `<name>.json` plus
//! the block's script payload.

use super::BlockDefinition;
use crate::compiler::BlockPaths;
use bakery_error::{BakeryError, BakeryResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct PackInfo {
    #[serde(rename = "loadOrder")]
    load_order: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CategoryFile {
    categories: Vec<Category>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub colour: String,
}

#[derive(Debug, Clone)]
pub struct RegisteredBlock {
    pub definition: BlockDefinition,
    /// Folder copied to the card as `PiBakery/blocks/<name>`.
    pub folder: PathBuf,
}

/// Every known block, by name.
#[derive(Debug, Clone, Default)]
pub struct BlockRegistry {
    blocks: HashMap<String, RegisteredBlock>,
    categories: Vec<Category>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `packs` in order; a block in a later pack replaces an earlier one
    /// of the same name. Packs that fail to load are skipped. When nothing
    /// loads, `fallback` is tried.
    pub fn load(packs: &[PathBuf], fallback: Option<&Path>) -> BakeryResult<Self> {
        let mut registry = Self::new();
        for pack in packs {
            if let Err(err) = registry.load_pack(pack) {
                log::warn!("⚠️ Skipping block pack {}: {}", pack.display(), err);
            }
        }

        if registry.is_empty() {
            if let Some(fallback) = fallback {
                log::info!("📦 Falling back to bundled blocks in {}", fallback.display());
                registry.load_pack(fallback)?;
            }
        }

        if registry.is_empty() {
            return Err(BakeryError::Block("no blocks could be loaded".to_string()));
        }
        log::info!("📦 Loaded {} blocks", registry.len());
        Ok(registry)
    }

    /// Load a single pack, returning how many blocks it contributed.
    pub fn load_pack(&mut self, dir: &Path) -> BakeryResult<usize> {
        let info: PackInfo = read_json(&dir.join("info.json"))?;

        let categories_path = dir.join("categories.json");
        if categories_path.is_file() {
            let file: CategoryFile = read_json(&categories_path)?;
            for category in file.categories {
                if !self.categories.iter().any(|c| c.name == category.name) {
                    self.categories.push(category);
                }
            }
        }

        let mut loaded = 0;
        for name in &info.load_order {
            let folder = dir.join(name);
            let definition: BlockDefinition = read_json(&folder.join(format!("{name}.json")))?;
            if definition.name != *name {
                return Err(BakeryError::Block(format!(
                    "{} declares name '{}'",
                    folder.display(),
                    definition.name
                )));
            }
            self.insert(definition, folder);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn insert(&mut self, definition: BlockDefinition, folder: PathBuf) {
        self.blocks.insert(
            definition.name.clone(),
            RegisteredBlock { definition, folder },
        );
    }

    pub fn get(&self, name: &str) -> Option<&BlockDefinition> {
        self.blocks.get(name).map(|b| &b.definition)
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockPaths for BlockRegistry {
    fn block_path(&self, name: &str) -> Option<PathBuf> {
        self.blocks.get(name).map(|b| b.folder.clone())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> BakeryResult<T> {
    let text = fs::read_to_string(path)
        .map_err(|e| BakeryError::Block(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| BakeryError::Block(format!("cannot parse {}: {e}", path.display())))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Write a pack with the given `(name, json)` blocks.
    pub(crate) fn write_pack(dir: &Path, blocks: &[(&str, &str)]) {
        fs::create_dir_all(dir).unwrap();
        let names: Vec<&str> = blocks.iter().map(|(n, _)| *n).collect();
        fs::write(
            dir.join("info.json"),
            serde_json::json!({ "loadOrder": names }).to_string(),
        )
        .unwrap();
        fs::write(
            dir.join("categories.json"),
            r#"{"categories": [{"name": "network", "display": "Network", "colour": "200"}]}"#,
        )
        .unwrap();
        for (name, json) in blocks {
            fs::create_dir_all(dir.join(name)).unwrap();
            fs::write(dir.join(name).join(format!("{name}.json")), json).unwrap();
        }
    }

    #[test]
    fn later_packs_replace_earlier_blocks() {
        let tmp = tempdir().unwrap();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        write_pack(
            &first,
            &[
                ("update", r#"{"name": "update", "script": "update.sh"}"#),
                ("reboot", r#"{"name": "reboot", "script": "reboot.sh", "continue": false}"#),
            ],
        );
        write_pack(
            &second,
            &[("update", r#"{"name": "update", "script": "new.sh", "network": true}"#)],
        );

        let registry = BlockRegistry::load(&[first.clone(), second.clone()], None).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("update").unwrap().script, "new.sh");
        assert_eq!(registry.block_path("update"), Some(second.join("update")));
        assert_eq!(registry.block_path("reboot"), Some(first.join("reboot")));
        assert!(!registry.get("reboot").unwrap().continues);
        assert_eq!(registry.categories().len(), 1);
    }

    #[test]
    fn broken_packs_fall_back() {
        let tmp = tempdir().unwrap();
        let broken = tmp.path().join("broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("info.json"), "not json").unwrap();
        let fallback = tmp.path().join("fallback");
        write_pack(
            &fallback,
            &[("shutdown", r#"{"name": "shutdown", "script": "shutdown.sh"}"#)],
        );

        let registry = BlockRegistry::load(&[broken], Some(&fallback)).unwrap();
        assert!(registry.get("shutdown").is_some());
    }

    #[test]
    fn no_blocks_is_an_error() {
        let tmp = tempdir().unwrap();
        let err = BlockRegistry::load(&[tmp.path().join("missing")], None).unwrap_err();
        assert_eq!(err.code(), "BLOCK_INVALID");
    }
}

//! Turns flattened block-graph lines into the three boot-phase scripts.
//!
//! Input lines come in three shapes: a phase marker (`_pibakery-oneveryboot`
//! and friends), a tab-indented step belonging to the current phase, or a
//! blank separator after which a phase marker is expected again. Indented
//! lines seen while a marker is expected are ignored.

use crate::phase::Phase;
use bakery_error::{BakeryError, BakeryResult};
use std::collections::HashMap;
use std::path::PathBuf;

/// Path prefix every block invocation on the device shares.
pub const BLOCKS_ROOT: &str = "/boot/PiBakery/blocks/";

/// Line emitted after a block that needs the network.
pub const NETWORK_MARKER: &str = "\tNETWORK=True";

/// Block whose position decides whether a phase must wait for the network.
pub const WIFI_BLOCK: &str = "wifisetup";

/// Script written for a phase without steps.
pub const EMPTY_SCRIPT: &str = "#!/bin/bash";

/// The compiled scripts, before block folders are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScripts {
    pub every_boot: String,
    pub first_boot: String,
    pub next_boot: String,
    /// Referenced blocks, first-seen order across all phases.
    pub block_names: Vec<String>,
    /// Indexed by [`Phase::index`].
    pub wait_for_network: [bool; 3],
}

impl CompiledScripts {
    pub fn script(&self, phase: Phase) -> &str {
        match phase {
            Phase::EveryBoot => &self.every_boot,
            Phase::FirstBoot => &self.first_boot,
            Phase::NextBoot => &self.next_boot,
        }
    }

    pub fn waits_for_network(&self, phase: Phase) -> bool {
        self.wait_for_network[phase.index()]
    }
}

/// Compiled scripts plus the source folder of every referenced block.
///
/// `block_paths[i]` is the folder of `scripts.block_names[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBundle {
    pub scripts: CompiledScripts,
    pub block_paths: Vec<PathBuf>,
}

impl ScriptBundle {
    pub fn block_names(&self) -> &[String] {
        &self.scripts.block_names
    }

    /// `(name, folder)` pairs in copy order.
    pub fn blocks(&self) -> impl Iterator<Item = (&str, &PathBuf)> {
        self.scripts
            .block_names
            .iter()
            .map(String::as_str)
            .zip(self.block_paths.iter())
    }
}

/// Block name -> source folder lookup.
pub trait BlockPaths {
    fn block_path(&self, name: &str) -> Option<PathBuf>;
}

impl BlockPaths for HashMap<String, PathBuf> {
    fn block_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).cloned()
    }
}

/// Name of the block a step line invokes: the path segment after
/// [`BLOCKS_ROOT`].
pub fn block_name_of(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once(BLOCKS_ROOT)?;
    rest.split('/').next().filter(|name| !name.is_empty())
}

/// Block names referenced by already generated script bodies, first-seen order.
pub fn recover_block_names<S: AsRef<str>>(scripts: &[S]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in scripts.iter().flat_map(|s| s.as_ref().lines()) {
        if let Some(name) = block_name_of(line) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

#[derive(Debug, Default)]
struct PhaseBody {
    body: String,
    steps: usize,
    network_at: Option<usize>,
    wifi_at: Option<usize>,
}

impl PhaseBody {
    fn push_step(&mut self, phase: Phase, command: &str, block: Option<&str>) {
        self.steps += 1;
        let caption = block.unwrap_or("(unnamed)");
        self.body.push_str(&format!(
            "\n{command} >>{log} 2>&1 || true\
             \necho XXX\
             \necho $(expr $PERCENTAGE \\* {step} )\
             \necho \"\\nProcessing {label} Script\\n\\nRunning Block: {caption}\"\
             \necho XXX",
            log = phase.log_file(),
            step = self.steps,
            label = phase.label(),
        ));
    }

    fn wait_for_network(&self) -> bool {
        match (self.network_at, self.wifi_at) {
            (Some(network), Some(wifi)) => network < wifi,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn into_script(self, phase: Phase) -> String {
        if self.steps == 0 {
            return EMPTY_SCRIPT.to_string();
        }
        format!(
            "#!/bin/bash\n\nPERCENTAGE={percentage}\n\n{{{body}\necho 100\n}} | whiptail --title \"PiBakery\" --gauge \"\\nProcessing {label} Script\\n\\n\\n\" 11 40 0",
            percentage = 100 / self.steps,
            body = self.body,
            label = phase.label(),
        )
    }
}

/// Compile flattened instruction lines into the three phase scripts.
///
/// Never fails: unknown lines are ignored and empty phases become
/// [`EMPTY_SCRIPT`].
pub fn compile<S: AsRef<str>>(lines: &[S]) -> CompiledScripts {
    let mut bodies: [PhaseBody; 3] = Default::default();
    let mut block_names: Vec<String> = Vec::new();
    let mut phase: Option<Phase> = None;
    let mut expect_marker = true;

    for line in lines.iter().map(AsRef::as_ref) {
        if let Some(command) = line.strip_prefix('\t') {
            if expect_marker {
                continue;
            }
            let Some(current) = phase else {
                continue;
            };
            let body = &mut bodies[current.index()];

            if line == NETWORK_MARKER {
                // Later markers overwrite earlier ones.
                body.network_at = Some(body.steps);
                continue;
            }

            let block = block_name_of(line);
            if let Some(name) = block {
                if !block_names.iter().any(|n| n == name) {
                    block_names.push(name.to_string());
                }
            }
            body.push_step(current, command, block);
            if block == Some(WIFI_BLOCK) && body.wifi_at.is_none() {
                body.wifi_at = Some(body.steps);
            }
        } else if let Some(marker) = Phase::from_marker(line) {
            phase = Some(marker);
            expect_marker = false;
        } else if line.is_empty() {
            expect_marker = true;
        }
    }

    let wait_for_network = [
        bodies[0].wait_for_network(),
        bodies[1].wait_for_network(),
        bodies[2].wait_for_network(),
    ];
    let [every, first, next] = bodies;

    CompiledScripts {
        every_boot: every.into_script(Phase::EveryBoot),
        first_boot: first.into_script(Phase::FirstBoot),
        next_boot: next.into_script(Phase::NextBoot),
        block_names,
        wait_for_network,
    }
}

/// Resolve every referenced block to its source folder.
pub fn bundle(scripts: CompiledScripts, blocks: &dyn BlockPaths) -> BakeryResult<ScriptBundle> {
    let block_paths = scripts
        .block_names
        .iter()
        .map(|name| {
            blocks
                .block_path(name)
                .ok_or_else(|| BakeryError::UnknownBlock(name.clone()))
        })
        .collect::<BakeryResult<Vec<_>>>()?;
    Ok(ScriptBundle {
        scripts,
        block_paths,
    })
}

pub fn compile_bundle<S: AsRef<str>>(
    lines: &[S],
    blocks: &dyn BlockPaths,
) -> BakeryResult<ScriptBundle> {
    bundle(compile(lines), blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIFI: &str = "\t/boot/PiBakery/blocks/wifisetup/run.sh";
    const UPDATE: &str = "\t/boot/PiBakery/blocks/update/run.sh";

    #[test]
    fn network_after_wifi_does_not_wait() {
        let lines = [
            "_pibakery-oneveryboot",
            WIFI,
            NETWORK_MARKER,
            UPDATE,
            "",
        ];
        let out = compile(&lines);
        assert!(!out.wait_for_network[0]);
        assert_eq!(out.block_names, vec!["wifisetup", "update"]);
    }

    #[test]
    fn network_before_wifi_waits() {
        let lines = [
            "_pibakery-oneveryboot",
            NETWORK_MARKER,
            WIFI,
            UPDATE,
            "",
        ];
        let out = compile(&lines);
        assert!(out.wait_for_network[0]);
        assert!(!out.wait_for_network[1]);
        assert!(!out.wait_for_network[2]);
    }

    #[test]
    fn network_without_wifi_waits() {
        let lines = ["_pibakery-onfirstboot", UPDATE, NETWORK_MARKER, ""];
        let out = compile(&lines);
        assert_eq!(out.wait_for_network, [false, true, false]);
    }

    #[test]
    fn last_network_marker_wins() {
        // The first marker alone would wait; the later one sits after the wifi step.
        let lines = [
            "_pibakery-oneveryboot",
            NETWORK_MARKER,
            WIFI,
            NETWORK_MARKER,
            "",
        ];
        assert!(!compile(&lines).wait_for_network[0]);
    }

    #[test]
    fn first_wifi_step_decides() {
        let lines = [
            "_pibakery-oneveryboot",
            WIFI,
            UPDATE,
            NETWORK_MARKER,
            WIFI,
            "",
        ];
        assert!(!compile(&lines).wait_for_network[0]);
    }

    #[test]
    fn empty_phases_are_bare_shebangs() {
        let out = compile::<&str>(&[]);
        assert_eq!(out.every_boot, EMPTY_SCRIPT);
        assert_eq!(out.first_boot, EMPTY_SCRIPT);
        assert_eq!(out.next_boot, EMPTY_SCRIPT);
        assert!(out.block_names.is_empty());
        assert_eq!(out.wait_for_network, [false; 3]);
    }

    #[test]
    fn percentage_is_floor_of_hundred_over_steps() {
        let lines = [
            "_pibakery-onnextboot",
            "\t/boot/PiBakery/blocks/a/a.sh",
            "\t/boot/PiBakery/blocks/b/b.sh",
            "\t/boot/PiBakery/blocks/c/c.sh",
            "",
        ];
        let out = compile(&lines);
        assert!(out.next_boot.starts_with("#!/bin/bash\n\nPERCENTAGE=33\n\n{"));
        assert!(out.next_boot.contains("echo $(expr $PERCENTAGE \\* 3 )"));
        assert!(out.next_boot.ends_with(
            "echo 100\n} | whiptail --title \"PiBakery\" --gauge \"\\nProcessing Next Boot Script\\n\\n\\n\" 11 40 0"
        ));
    }

    #[test]
    fn step_lines_log_and_tolerate_failure() {
        let lines = ["_pibakery-onfirstboot", UPDATE, ""];
        let out = compile(&lines);
        assert!(out.first_boot.contains(
            "\n/boot/PiBakery/blocks/update/run.sh >>/boot/PiBakery/firstboot.log 2>&1 || true\necho XXX\necho $(expr $PERCENTAGE \\* 1 )\necho \"\\nProcessing First Boot Script\\n\\nRunning Block: update\"\necho XXX"
        ));
    }

    #[test]
    fn shared_block_is_listed_once_but_runs_in_both_phases() {
        let lines = [
            "_pibakery-oneveryboot",
            UPDATE,
            "",
            "_pibakery-onfirstboot",
            UPDATE,
            WIFI,
            "",
        ];
        let out = compile(&lines);
        assert_eq!(out.block_names, vec!["update", "wifisetup"]);
        assert!(out.every_boot.contains("blocks/update/run.sh"));
        assert!(out.first_boot.contains("blocks/update/run.sh"));
        assert!(out.first_boot.contains("PERCENTAGE=50"));
    }

    #[test]
    fn indented_lines_before_a_marker_are_ignored() {
        let lines = [UPDATE, "", WIFI, "_pibakery-onfirstboot", WIFI, ""];
        let out = compile(&lines);
        assert_eq!(out.block_names, vec!["wifisetup"]);
        assert_eq!(out.every_boot, EMPTY_SCRIPT);
        assert!(out.first_boot.contains("PERCENTAGE=100"));
    }

    #[test]
    fn block_names_are_recoverable_from_scripts() {
        let lines = [
            "_pibakery-oneveryboot",
            "\t/boot/PiBakery/blocks/hostname/hostname.sh pi",
            "",
            "_pibakery-onfirstboot",
            WIFI,
            "\t/boot/PiBakery/blocks/hostname/hostname.sh other",
            "",
            "_pibakery-onnextboot",
            UPDATE,
            "",
        ];
        let out = compile(&lines);
        let recovered = recover_block_names(&[&out.every_boot, &out.first_boot, &out.next_boot]);
        assert_eq!(recovered, out.block_names);
    }

    #[test]
    fn bundle_resolves_paths_in_block_order() {
        let lines = ["_pibakery-oneveryboot", WIFI, UPDATE, ""];
        let mut paths = HashMap::new();
        paths.insert("wifisetup".to_string(), PathBuf::from("/packs/a/wifisetup"));
        paths.insert("update".to_string(), PathBuf::from("/packs/a/update"));

        let bundle = compile_bundle(&lines, &paths).unwrap();
        assert_eq!(bundle.block_paths.len(), bundle.block_names().len());
        assert_eq!(bundle.block_paths[1], PathBuf::from("/packs/a/update"));

        paths.remove("update");
        let err = compile_bundle(&lines, &paths).unwrap_err();
        assert!(matches!(err, BakeryError::UnknownBlock(ref name) if name == "update"));
    }
}

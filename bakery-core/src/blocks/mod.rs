//! Block definitions and the code they generate.
//!
//! A block is described by a JSON record shipped in a block pack. Code
//! generation is a pure function of that record and the field values of one
//! placed instance.

pub mod escape;
pub mod loader;

use crate::compiler::{BLOCKS_ROOT, NETWORK_MARKER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use escape::shell_escape;
pub use loader::BlockRegistry;

/// Field values of a placed block, keyed by field name (`"1"`, `"2"`, ...).
pub type FieldValues = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    Text,
    Number,
    Menu,
    Check,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    #[serde(rename = "type")]
    pub kind: ArgKind,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Zero means unlimited.
    #[serde(default, rename = "maxLength")]
    pub max_length: usize,
    #[serde(default)]
    pub options: Vec<String>,
}

impl ArgSpec {
    /// Initial field value for a freshly placed block.
    pub fn default_value(&self) -> String {
        match (&self.default, self.kind) {
            (Some(serde_json::Value::String(s)), _) => s.clone(),
            (Some(serde_json::Value::Bool(b)), _) => String::from(if *b { "TRUE" } else { "FALSE" }),
            (Some(serde_json::Value::Number(n)), _) => n.to_string(),
            (_, ArgKind::Menu) => self.options.first().cloned().unwrap_or_default(),
            (_, ArgKind::Check) => "FALSE".to_string(),
            _ => String::new(),
        }
    }

    /// Clean up a value typed into this field.
    ///
    /// Number fields keep only digits; text and number fields are cut to
    /// `max_length` characters when a limit is set.
    pub fn sanitize(&self, value: &str) -> String {
        match self.kind {
            ArgKind::Number | ArgKind::Text => {
                let kept: String = if self.kind == ArgKind::Number {
                    value.chars().filter(char::is_ascii_digit).collect()
                } else {
                    value.to_string()
                };
                if self.max_length != 0 {
                    kept.chars().take(self.max_length).collect()
                } else {
                    kept
                }
            }
            ArgKind::Menu | ArgKind::Check => value.to_string(),
        }
    }
}

fn default_continue() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub name: String,
    #[serde(default)]
    pub text: String,
    pub script: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    /// The block needs a network connection before it runs.
    #[serde(default)]
    pub network: bool,
    /// Whether another block may follow this one.
    #[serde(default = "default_continue", rename = "continue")]
    pub continues: bool,
    #[serde(default)]
    pub category: String,
    #[serde(default, rename = "shortDescription")]
    pub short_description: String,
    #[serde(default, rename = "longDescription")]
    pub long_description: String,
    #[serde(default, rename = "supportedOperatingSystems")]
    pub supported_operating_systems: Vec<String>,
}

impl BlockDefinition {
    /// Where the block's script lives once installed on the card.
    pub fn script_path(&self) -> String {
        format!("{BLOCKS_ROOT}{}/{}", self.name, self.script)
    }

    pub fn field_name(index: usize) -> String {
        (index + 1).to_string()
    }

    pub fn default_fields(&self) -> FieldValues {
        self.args
            .iter()
            .enumerate()
            .map(|(i, arg)| (Self::field_name(i), arg.default_value()))
            .collect()
    }

    /// Sanitize one field value; unknown fields are returned unchanged.
    pub fn sanitize_field(&self, field: &str, value: &str) -> String {
        field
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| self.args.get(i))
            .map(|arg| arg.sanitize(value))
            .unwrap_or_else(|| value.to_string())
    }

    /// Instruction lines for one placed instance of this block.
    pub fn generate(&self, fields: &FieldValues) -> Vec<String> {
        let path = self.script_path();
        let mut invocation = format!("\t{path}");
        for i in 0..self.args.len() {
            let value = fields
                .get(&Self::field_name(i))
                .map(String::as_str)
                .unwrap_or_default();
            let escaped = shell_escape(value);
            invocation.push(' ');
            invocation.push_str(if escaped.is_empty() {
                "\"\""
            } else {
                escaped.as_str()
            });
        }

        let mut lines = vec![format!("\tchmod 755 {path}"), invocation];
        if self.network {
            lines.push(NETWORK_MARKER.to_string());
        }
        lines
    }
}

//! Recipe documents: the workspace saved as Blockly-style XML.
//!
//! ```xml
//! <xml xmlns="http://www.w3.org/1999/xhtml">
//!   <block type="onfirstboot" id="b1" x="20" y="20">
//!     <next><block type="hostname" id="b2"><field name="1">pi</field></block></next>
//!   </block>
//!   <firstboot>1</firstboot>
//! </xml>
//! ```

pub mod transform;

use crate::graph::{BlockInstance, Hat, Stack, Workspace};
use crate::phase::Phase;
use bakery_error::{BakeryError, BakeryResult};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

pub use transform::upgrade;

const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";

/// One `<block>` element without its successors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeBlock {
    pub kind: String,
    pub id: String,
    /// `(name, value)` in document order.
    pub fields: Vec<(String, String)>,
}

impl RecipeBlock {
    pub fn new(kind: &str, id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_field(&mut self, name: &str, value: &str) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.fields.push((name.to_string(), value.to_string())),
        }
    }
}

/// A top-level chain; `blocks[0]` is the hat when the chain has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeStack {
    pub x: i64,
    pub y: i64,
    pub blocks: Vec<RecipeBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    pub stacks: Vec<RecipeStack>,
    /// `None` for recipes exported without a `<firstboot>` element.
    pub first_boot: Option<bool>,
}

impl Recipe {
    pub fn parse(xml: &str) -> BakeryResult<Self> {
        let root = parse_tree(xml)?;
        if root.name != "xml" {
            return Err(BakeryError::Recipe(format!(
                "expected <xml> root, found <{}>",
                root.name
            )));
        }

        let mut recipe = Recipe::default();
        for child in &root.children {
            match child.name.as_str() {
                "block" => recipe.stacks.push(RecipeStack {
                    x: child.attr_num("x"),
                    y: child.attr_num("y"),
                    blocks: read_chain(child),
                }),
                "firstboot" => recipe.first_boot = Some(child.text.trim() == "1"),
                _ => {}
            }
        }
        Ok(recipe)
    }

    pub fn from_workspace(workspace: &Workspace, first_boot: bool) -> Self {
        let stacks = workspace
            .stacks()
            .iter()
            .map(|stack| {
                let hat = stack
                    .hat
                    .as_ref()
                    .map(|h| RecipeBlock::new(h.phase.hat_type(), &h.id));
                let blocks = hat
                    .into_iter()
                    .chain(stack.blocks.iter().map(|b| RecipeBlock {
                        kind: b.kind.clone(),
                        id: b.id.clone(),
                        fields: b.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    }))
                    .collect();
                RecipeStack {
                    x: stack.x,
                    y: stack.y,
                    blocks,
                }
            })
            .collect();
        Recipe {
            stacks,
            first_boot: Some(first_boot),
        }
    }

    /// Point every hat at the boot mode the card is being prepared for:
    /// first-boot recipes lose their next-boot hats and vice versa.
    pub fn retarget_hats(&mut self, first_boot: bool) {
        let (from, to) = if first_boot {
            (Phase::NextBoot, Phase::FirstBoot)
        } else {
            (Phase::FirstBoot, Phase::NextBoot)
        };
        for block in self.stacks.iter_mut().flat_map(|s| s.blocks.iter_mut()) {
            if block.kind == from.hat_type() {
                block.kind = to.hat_type().to_string();
            }
        }
        self.first_boot = Some(first_boot);
    }

    pub fn into_workspace(self) -> Workspace {
        let stacks = self
            .stacks
            .into_iter()
            .filter(|s| !s.blocks.is_empty())
            .map(|s| {
                let mut blocks = s.blocks.into_iter().peekable();
                let hat = blocks
                    .next_if(|b| Phase::from_hat_type(&b.kind).is_some())
                    .and_then(|b| {
                        Phase::from_hat_type(&b.kind).map(|phase| Hat { id: b.id, phase })
                    });
                Stack {
                    hat,
                    x: s.x,
                    y: s.y,
                    blocks: blocks
                        .map(|b| BlockInstance {
                            kind: b.kind,
                            id: b.id,
                            fields: b.fields.into_iter().collect(),
                        })
                        .collect(),
                }
            })
            .collect();
        Workspace::from_stacks(stacks)
    }

    pub fn to_xml(&self) -> BakeryResult<String> {
        let mut writer = Writer::new(Vec::new());
        write_event(
            &mut writer,
            Event::Start(BytesStart::new("xml").with_attributes([("xmlns", XHTML_NS)])),
        )?;
        for stack in &self.stacks {
            let (x, y) = (stack.x.to_string(), stack.y.to_string());
            write_chain(&mut writer, &stack.blocks, Some((&x, &y)))?;
        }
        if let Some(first_boot) = self.first_boot {
            write_event(&mut writer, Event::Start(BytesStart::new("firstboot")))?;
            write_event(
                &mut writer,
                Event::Text(BytesText::new(if first_boot { "1" } else { "0" })),
            )?;
            write_event(&mut writer, Event::End(BytesEnd::new("firstboot")))?;
        }
        write_event(&mut writer, Event::End(BytesEnd::new("xml")))?;
        String::from_utf8(writer.into_inner()).map_err(|e| BakeryError::Recipe(e.to_string()))
    }
}

fn write_event(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> BakeryResult<()> {
    writer
        .write_event(event)
        .map_err(|e| BakeryError::Recipe(format!("cannot write recipe: {e}")))
}

fn write_chain(
    writer: &mut Writer<Vec<u8>>,
    chain: &[RecipeBlock],
    position: Option<(&str, &str)>,
) -> BakeryResult<()> {
    let Some((block, rest)) = chain.split_first() else {
        return Ok(());
    };
    let mut start =
        BytesStart::new("block").with_attributes([("type", block.kind.as_str()), ("id", block.id.as_str())]);
    if let Some((x, y)) = position {
        start.push_attribute(("x", x));
        start.push_attribute(("y", y));
    }
    write_event(writer, Event::Start(start))?;
    for (name, value) in &block.fields {
        write_event(
            writer,
            Event::Start(BytesStart::new("field").with_attributes([("name", name.as_str())])),
        )?;
        write_event(writer, Event::Text(BytesText::new(value)))?;
        write_event(writer, Event::End(BytesEnd::new("field")))?;
    }
    if !rest.is_empty() {
        write_event(writer, Event::Start(BytesStart::new("next")))?;
        write_chain(writer, rest, None)?;
        write_event(writer, Event::End(BytesEnd::new("next")))?;
    }
    write_event(writer, Event::End(BytesEnd::new("block")))
}

/// Minimal element tree; namespaces are dropped.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn attr_num(&self, key: &str) -> i64 {
        self.attr(key)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|v| v as i64)
            .unwrap_or(0)
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }
}

fn recipe_err(err: impl std::fmt::Display) -> BakeryError {
    BakeryError::Recipe(err.to_string())
}

fn open_element(start: &BytesStart<'_>) -> BakeryResult<Element> {
    let mut element = Element {
        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        ..Element::default()
    };
    for attr in start.attributes() {
        let attr = attr.map_err(recipe_err)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(recipe_err)?.into_owned();
        element.attrs.push((key, value));
    }
    Ok(element)
}

fn parse_tree(xml: &str) -> BakeryResult<Element> {
    let mut reader = Reader::from_str(xml);
    let mut open: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event().map_err(recipe_err)? {
            Event::Start(start) => open.push(open_element(&start)?),
            Event::Empty(start) => {
                let element = open_element(&start)?;
                match open.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = root.or(Some(element)),
                }
            }
            Event::Text(text) => {
                if let Some(current) = open.last_mut() {
                    current.text.push_str(&text.unescape().map_err(recipe_err)?);
                }
            }
            Event::CData(data) => {
                if let Some(current) = open.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(_) => {
                let element = open
                    .pop()
                    .ok_or_else(|| BakeryError::Recipe("unbalanced closing tag".to_string()))?;
                match open.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = root.or(Some(element)),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !open.is_empty() {
        return Err(BakeryError::Recipe("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| BakeryError::Recipe("empty document".to_string()))
}

fn read_chain(first: &Element) -> Vec<RecipeBlock> {
    let mut chain = Vec::new();
    let mut current = Some(first);
    while let Some(element) = current {
        let mut block = RecipeBlock::new(
            element.attr("type").unwrap_or_default(),
            element.attr("id").unwrap_or_default(),
        );
        for field in element.children.iter().filter(|c| c.name == "field") {
            if let Some(name) = field.attr("name") {
                block.fields.push((name.to_string(), field.text.clone()));
            }
        }
        chain.push(block);
        current = element.child("next").and_then(|n| n.child("block"));
    }
    chain
}

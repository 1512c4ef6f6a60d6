//! Block tree to text rendering.
//!
//! [`MarkdownRenderer`] dispatches on the block tag through a
//! [`HandlerRegistry`]; hosts can replace or add handlers without touching the
//! walker.
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::notion::model::{plain_text, BlockNode};

const MAX_RENDER_DEPTH: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub body: String,
}

pub trait ContentRenderer: Send + Sync {
    fn render(&self, blocks: &[BlockNode]) -> Document;
}

/// Renders the block itself, without its children. `None` emits nothing.
pub type BlockHandler = Box<dyn Fn(&BlockNode) -> Option<String> + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BlockHandler>,
}

impl HandlerRegistry {
    pub fn register<F>(&mut self, tag: &str, handler: F)
    where
        F: Fn(&BlockNode) -> Option<String> + Send + Sync + 'static,
    {
        self.handlers.insert(tag.to_string(), Box::new(handler));
    }

    pub fn get(&self, tag: &str) -> Option<&BlockHandler> {
        self.handlers.get(tag)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct MarkdownRenderer {
    registry: HandlerRegistry,
}

impl Default for MarkdownRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        let mut registry = HandlerRegistry::default();
        registry.register("paragraph", |b| Some(b.plain_text()));
        registry.register("heading_1", |b| Some(format!("# {}", b.plain_text())));
        registry.register("heading_2", |b| Some(format!("## {}", b.plain_text())));
        registry.register("heading_3", |b| Some(format!("### {}", b.plain_text())));
        registry.register("bulleted_list_item", |b| Some(format!("- {}", b.plain_text())));
        registry.register("numbered_list_item", |b| Some(format!("1. {}", b.plain_text())));
        registry.register("toggle", |b| Some(format!("- {}", b.plain_text())));
        registry.register("to_do", |b| {
            let checked = b.data.get("checked").and_then(Value::as_bool) == Some(true);
            Some(format!("- [{}] {}", if checked { "x" } else { " " }, b.plain_text()))
        });
        registry.register("quote", |b| Some(format!("> {}", b.plain_text())));
        registry.register("callout", |b| {
            let icon = b
                .data
                .get("icon")
                .and_then(|i| i.get("emoji"))
                .and_then(Value::as_str)
                .map(|e| format!("{} ", e))
                .unwrap_or_default();
            Some(format!("> {}{}", icon, b.plain_text()))
        });
        registry.register("code", |b| {
            let language = b.data.get("language").and_then(Value::as_str).unwrap_or("");
            Some(format!("```{}\n{}\n```", language, b.plain_text()))
        });
        registry.register("equation", |b| {
            b.data
                .get("expression")
                .and_then(Value::as_str)
                .map(|e| format!("$$\n{}\n$$", e))
        });
        registry.register("divider", |_| Some("---".to_string()));
        for tag in ["image", "video", "file", "pdf", "audio"] {
            registry.register(tag, render_media);
        }
        for tag in ["bookmark", "embed", "link_preview"] {
            registry.register(tag, |b| {
                b.data
                    .get("url")
                    .and_then(Value::as_str)
                    .map(|u| format!("<{}>", u))
            });
        }
        registry.register("child_page", |b| {
            b.data
                .get("title")
                .and_then(Value::as_str)
                .map(|t| format!("[{}]", t))
        });
        registry.register("table_row", |b| {
            let cells = b.data.get("cells").and_then(Value::as_array)?;
            let cells: Vec<String> = cells.iter().map(plain_text).collect();
            Some(format!("| {} |", cells.join(" | ")))
        });
        // Containers contribute nothing themselves; their children render.
        for tag in ["table", "column_list", "column", "synced_block"] {
            registry.register(tag, |_| None);
        }
        Self { registry }
    }

    pub fn with_handler<F>(mut self, tag: &str, handler: F) -> Self
    where
        F: Fn(&BlockNode) -> Option<String> + Send + Sync + 'static,
    {
        self.registry.register(tag, handler);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    fn render_nodes(
        &self,
        blocks: &[BlockNode],
        depth: usize,
        visited: &mut HashSet<String>,
        lines: &mut Vec<String>,
    ) {
        if depth > MAX_RENDER_DEPTH {
            return;
        }
        for block in blocks {
            if !visited.insert(block.id.clone()) {
                continue;
            }
            let own = match self.registry.get(block.kind.as_str()) {
                Some(handler) => handler(block),
                None => Some(block.plain_text()).filter(|t| !t.is_empty()),
            };
            // Containers do not indent their children.
            let child_depth = if own.is_some() { depth + 1 } else { depth };
            if let Some(text) = own {
                let indent = "  ".repeat(depth);
                for line in text.lines() {
                    lines.push(format!("{}{}", indent, line).trim_end().to_string());
                }
                if text.is_empty() {
                    lines.push(String::new());
                }
            }
            self.render_nodes(&block.children, child_depth, visited, lines);
        }
    }
}

impl ContentRenderer for MarkdownRenderer {
    fn render(&self, blocks: &[BlockNode]) -> Document {
        let mut lines = Vec::new();
        let mut visited = HashSet::new();
        self.render_nodes(blocks, 0, &mut visited, &mut lines);
        Document {
            body: lines.join("\n"),
        }
    }
}

fn render_media(block: &BlockNode) -> Option<String> {
    let source = block
        .data
        .get("type")
        .and_then(Value::as_str)
        .and_then(|t| block.data.get(t))
        .and_then(|s| s.get("url"))
        .and_then(Value::as_str)?;
    let caption = block.data.get("caption").map(plain_text).unwrap_or_default();
    if block.kind.as_str() == "image" {
        Some(format!("![{}]({})", caption, source))
    } else {
        let label = if caption.is_empty() {
            block.kind.as_str().to_string()
        } else {
            caption
        };
        Some(format!("[{}]({})", label, source))
    }
}

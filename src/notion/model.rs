use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RemoteError;

#[derive(Deserialize, Debug)]
pub struct DatabaseProperty {
    pub id: String,
    #[serde(rename = "type")]
    pub typ: String,
}

#[derive(Deserialize, Debug)]
pub struct RetrieveDatabaseResp {
    pub id: String,
    pub title: Vec<Value>,
    pub properties: std::collections::HashMap<String, DatabaseProperty>,
}

/// One page of a cursor-paginated listing.
#[derive(Deserialize, Debug)]
pub struct ListPage<T> {
    pub results: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A page of the remote database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    pub last_edited_time: DateTime<Utc>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Pages always carry a block body, so this defaults to true when the API
    /// omits it.
    #[serde(default = "default_true")]
    pub has_children: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub cover: Option<Value>,
}

impl RemoteRecord {
    /// Plain text of the `title` property, whatever its display name.
    pub fn title(&self) -> Option<String> {
        self.properties
            .values()
            .find(|prop| prop.get("type").and_then(Value::as_str) == Some("title"))
            .and_then(|prop| prop.get("title"))
            .map(plain_text)
            .filter(|t| !t.is_empty())
    }

    /// URL of a Notion-hosted cover image. External covers are left alone.
    pub fn hosted_cover_url(&self) -> Option<&str> {
        self.cover.as_ref().and_then(hosted_file_url)
    }
}

/// Concatenate `plain_text` of a rich text array.
pub fn plain_text(rich_text: &Value) -> String {
    rich_text
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// `{"type":"file","file":{"url":..}}` -> url. Notion-hosted URLs expire, which
/// is why only these get downloaded.
fn hosted_file_url(file: &Value) -> Option<&str> {
    if file.get("type").and_then(Value::as_str) != Some("file") {
        return None;
    }
    file.get("file")
        .and_then(|f| f.get("url"))
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum BlockKind {
    Paragraph,
    Heading1,
    Heading2,
    Heading3,
    BulletedListItem,
    NumberedListItem,
    ToDo,
    Toggle,
    Quote,
    Callout,
    Code,
    Image,
    Video,
    File,
    Pdf,
    Audio,
    Bookmark,
    Embed,
    Equation,
    Divider,
    Table,
    TableRow,
    ColumnList,
    Column,
    SyncedBlock,
    ChildPage,
    ChildDatabase,
    LinkPreview,
    LinkToPage,
    Breadcrumb,
    TableOfContents,
    Unsupported,
    Other(String),
}

impl BlockKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "paragraph" => BlockKind::Paragraph,
            "heading_1" => BlockKind::Heading1,
            "heading_2" => BlockKind::Heading2,
            "heading_3" => BlockKind::Heading3,
            "bulleted_list_item" => BlockKind::BulletedListItem,
            "numbered_list_item" => BlockKind::NumberedListItem,
            "to_do" => BlockKind::ToDo,
            "toggle" => BlockKind::Toggle,
            "quote" => BlockKind::Quote,
            "callout" => BlockKind::Callout,
            "code" => BlockKind::Code,
            "image" => BlockKind::Image,
            "video" => BlockKind::Video,
            "file" => BlockKind::File,
            "pdf" => BlockKind::Pdf,
            "audio" => BlockKind::Audio,
            "bookmark" => BlockKind::Bookmark,
            "embed" => BlockKind::Embed,
            "equation" => BlockKind::Equation,
            "divider" => BlockKind::Divider,
            "table" => BlockKind::Table,
            "table_row" => BlockKind::TableRow,
            "column_list" => BlockKind::ColumnList,
            "column" => BlockKind::Column,
            "synced_block" => BlockKind::SyncedBlock,
            "child_page" => BlockKind::ChildPage,
            "child_database" => BlockKind::ChildDatabase,
            "link_preview" => BlockKind::LinkPreview,
            "link_to_page" => BlockKind::LinkToPage,
            "breadcrumb" => BlockKind::Breadcrumb,
            "table_of_contents" => BlockKind::TableOfContents,
            "unsupported" => BlockKind::Unsupported,
            other => BlockKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::Heading1 => "heading_1",
            BlockKind::Heading2 => "heading_2",
            BlockKind::Heading3 => "heading_3",
            BlockKind::BulletedListItem => "bulleted_list_item",
            BlockKind::NumberedListItem => "numbered_list_item",
            BlockKind::ToDo => "to_do",
            BlockKind::Toggle => "toggle",
            BlockKind::Quote => "quote",
            BlockKind::Callout => "callout",
            BlockKind::Code => "code",
            BlockKind::Image => "image",
            BlockKind::Video => "video",
            BlockKind::File => "file",
            BlockKind::Pdf => "pdf",
            BlockKind::Audio => "audio",
            BlockKind::Bookmark => "bookmark",
            BlockKind::Embed => "embed",
            BlockKind::Equation => "equation",
            BlockKind::Divider => "divider",
            BlockKind::Table => "table",
            BlockKind::TableRow => "table_row",
            BlockKind::ColumnList => "column_list",
            BlockKind::Column => "column",
            BlockKind::SyncedBlock => "synced_block",
            BlockKind::ChildPage => "child_page",
            BlockKind::ChildDatabase => "child_database",
            BlockKind::LinkPreview => "link_preview",
            BlockKind::LinkToPage => "link_to_page",
            BlockKind::Breadcrumb => "breadcrumb",
            BlockKind::TableOfContents => "table_of_contents",
            BlockKind::Unsupported => "unsupported",
            BlockKind::Other(tag) => tag,
        }
    }

    /// Kinds whose children are never fetched: the call is either guaranteed
    /// to fail or points outside the current page.
    pub fn is_recursable(&self) -> bool {
        !matches!(
            self,
            BlockKind::ChildPage
                | BlockKind::ChildDatabase
                | BlockKind::LinkPreview
                | BlockKind::LinkToPage
                | BlockKind::Unsupported
        )
    }

    pub fn is_media(&self) -> bool {
        matches!(
            self,
            BlockKind::Image | BlockKind::Video | BlockKind::File | BlockKind::Pdf | BlockKind::Audio
        )
    }
}

impl From<BlockKind> for String {
    fn from(kind: BlockKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockNode {
    pub id: String,
    pub kind: BlockKind,
    pub has_children: bool,
    /// The type-specific payload, i.e. `block[block.type]`.
    pub data: Value,
    pub children: Vec<BlockNode>,
}

impl BlockNode {
    pub fn from_value(value: &Value) -> Result<Self, RemoteError> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Payload("block without id".into()))?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Payload(format!("block {} without type", id)))?;
        Ok(Self {
            id: id.to_string(),
            kind: BlockKind::from_tag(tag),
            has_children: value
                .get("has_children")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            data: value.get(tag).cloned().unwrap_or(Value::Null),
            children: Vec::new(),
        })
    }

    /// Whether the fetch client should ask for this node's children.
    pub fn wants_children(&self) -> bool {
        self.has_children && self.kind.is_recursable()
    }

    /// Attach fetched children. A node that reports no children keeps none.
    pub fn set_children(&mut self, children: Vec<BlockNode>) {
        if self.has_children {
            self.children = children;
        }
    }

    pub fn plain_text(&self) -> String {
        self.data
            .get("rich_text")
            .map(plain_text)
            .unwrap_or_default()
    }

    pub fn hosted_media_url(&self) -> Option<&str> {
        if !self.kind.is_media() {
            return None;
        }
        hosted_file_url(&self.data)
    }

    /// Depth-first walk over this node and its descendants.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a BlockNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

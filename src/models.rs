//! Data models shared by the sync pipeline and the read API.
//!
//! This module defines the core data structures used throughout the application:
//! - [`Magazine`]: A published magazine as listed by the read API
//! - [`ContentItem`]: A normalized magazine content row from Notion
//! - [`RawContent`]: What the Telegram preview page tells us about a message
//! - [`ShareInput`] / [`ShareDetails`]: The payload pushed to Nomland
//! - [`ShareNote`], [`NoteMetadata`], [`NoteKey`]: Previously published state
//!
//! `Magazine` keeps camelCase field names so the `magazinesList` file keeps
//! the shape its readers already consume, hence `#[allow(non_snake_case)]`.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A published magazine.
///
/// Written verbatim (as a list) to `{api_dir}/magazinesList`.
#[allow(non_snake_case)]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Magazine {
    /// Magazine title.
    pub title: String,
    /// Subtitle shown under the title.
    pub subTitle: String,
    /// Custom, unique web path suffix.
    pub slug: String,
    /// Who curated this issue.
    pub curator: String,
    /// Curator's preface, all rich-text fragments joined.
    pub preface: String,
    /// Web2 gateway URL of the banner after upload to IPFS.
    pub banner: String,
    /// Notion page id of the magazine.
    pub uid: String,
}

/// A magazine content row, normalized from its Notion properties.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentItem {
    /// Notion page id.
    pub page_id: String,
    pub title: Option<String>,
    /// Link to the Telegram message being shared.
    pub tg_url: String,
    /// Crossbell character id of the sharer.
    pub author_id: String,
    /// The sharer's Telegram account URL as recorded in Notion.
    pub author_tg_account: String,
    /// Review text entered in Notion; wins over the scraped text.
    pub notion_review: Option<String>,
    /// Review URL entered in Notion; wins over the scraped URL.
    pub notion_review_url: Option<String>,
    /// Position inside the magazine, numeric but stored as text.
    pub order: String,
    pub replies: Option<String>,
    /// Notion page id of the owning magazine.
    pub magazine_id: String,
}

/// A Notion database page as returned by a database query.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotionPage {
    pub id: String,
    pub last_edited_time: DateTime<Utc>,
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
}

/// Author, text and publish date scraped from a Telegram message preview.
#[derive(Debug, Clone, PartialEq)]
pub struct RawContent {
    /// `href` of the author link, i.e. the author's account URL.
    pub author_url: Option<String>,
    /// Message date; the scrape time when the page does not carry one.
    pub publish_date: DateTime<Utc>,
    /// Message text with links, bot mentions and hashtags removed.
    pub content: Option<String>,
    /// First URL found in the message text.
    pub entity_url: Option<String>,
    /// Message text as shown on the preview page.
    pub raw_text: Option<String>,
}

/// Identifies a note on Crossbell; rendered as `"{characterId}-{noteId}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct NoteKey {
    #[serde(rename = "characterId", deserialize_with = "id_string")]
    pub character_id: String,
    #[serde(rename = "noteId", deserialize_with = "id_string")]
    pub note_id: String,
}

impl NoteKey {
    pub fn new(character_id: impl Into<String>, note_id: impl Into<String>) -> Self {
        Self {
            character_id: character_id.into(),
            note_id: note_id.into(),
        }
    }
}

impl fmt::Display for NoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.character_id, self.note_id)
    }
}

impl FromStr for NoteKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('-') {
            Some((character_id, note_id)) if !character_id.is_empty() && !note_id.is_empty() => {
                Ok(NoteKey::new(character_id, note_id))
            }
            _ => Err(Error::NoteKey(s.to_string())),
        }
    }
}

/// Character and note ids come back as numbers from some endpoints and as
/// strings from others.
fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// The share-specific part of a [`ShareInput`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ShareDetails {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub sources: Vec<String>,
    /// The Telegram message URL.
    pub external_url: String,
    pub submitted_by: String,
    #[serde(rename = "rawContent")]
    pub raw_content: Vec<String>,
    /// RFC 3339 timestamp with millisecond precision.
    pub date_published: String,
}

/// Payload for creating a share.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ShareInput {
    /// Character id of the sharer.
    pub author: String,
    /// Character id of the publishing context.
    pub context: String,
    pub details: ShareDetails,
    /// URL of the shared thing (the "entity").
    #[serde(rename = "entityUrl")]
    pub entity_url: String,
}

/// Details of an already published share, every field optional because
/// older notes may lack some of them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NoteDetails {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date_published: Option<String>,
    #[serde(default)]
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ShareNoteBody {
    pub key: NoteKey,
    #[serde(default)]
    pub details: NoteDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EntityMetadata {
    #[serde(default)]
    pub url: Option<String>,
}

/// An entity record on the social graph, referenced by shares.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EntityRecord {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub metadata: EntityMetadata,
}

/// A published share together with the entity it points at.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ShareNote {
    pub note: ShareNoteBody,
    pub entity: EntityRecord,
}

/// One `{trait_type, value}` attribute of a note.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NoteAttribute {
    pub trait_type: String,
    pub value: Value,
}

/// Raw note metadata as stored on chain. Only the fields the sync rewrites
/// are typed; everything else passes through untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NoteMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_published: Option<String>,
    #[serde(default)]
    pub external_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<NoteAttribute>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl NoteMetadata {
    /// Mutable access to the attribute with the given `trait_type`, if any.
    pub fn attribute_mut(&mut self, trait_type: &str) -> Option<&mut NoteAttribute> {
        self.attributes
            .as_mut()?
            .iter_mut()
            .find(|attr| attr.trait_type == trait_type)
    }
}

/// Metadata extracted from a shared page, used to create an entity.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Entity {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// An IPFS upload result.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IpfsFile {
    /// `ipfs://` URL.
    pub url: String,
    /// The same file behind an HTTP gateway.
    pub web2url: String,
}

//! Non-secret settings loaded from an optional YAML file.
//!
//! Secrets and per-deployment identity (API keys, context ids) come from the
//! environment through [`crate::cli`]; everything here has a working default
//! so the file only needs to list what differs.
//!
//! ```yaml
//! bot_name: nuntibot
//! notion:
//!   magazine_db_id: 7e15c621192d49519aa9291165c4f7ca
//! nomland_endpoint: https://gateway.example.org
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub notion: NotionSettings,
    /// Bot handle stripped (as `@bot_name`) from scraped message text.
    pub bot_name: String,
    /// Base URL of the Nomland gateway.
    pub nomland_endpoint: String,
    /// IPFS relay upload endpoint.
    pub ipfs_endpoint: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            notion: NotionSettings::default(),
            bot_name: "nuntibot".to_string(),
            nomland_endpoint: "http://127.0.0.1:8787".to_string(),
            ipfs_endpoint: "https://ipfs-relay.crossbell.io/upload".to_string(),
        }
    }
}

/// Where the Notion databases live and what their columns are called.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NotionSettings {
    pub api_base: String,
    pub api_version: String,
    pub magazine_db_id: String,
    pub magazine_content_db_id: String,
    pub properties: NotionProperties,
}

impl Default for NotionSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.notion.com/v1".to_string(),
            api_version: "2022-06-28".to_string(),
            magazine_db_id: "7e15c621192d49519aa9291165c4f7ca".to_string(),
            magazine_content_db_id: "89e17384c64549a0b5d363beb5c6ed2e".to_string(),
            properties: NotionProperties::default(),
        }
    }
}

/// Column names (and the ids used in query filters) of both databases.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NotionProperties {
    pub status: String,
    pub published_status: String,
    pub magazines_relation: String,
    pub tg_link: String,
    pub tg_link_filter: String,
    pub review_title: String,
    pub tg_account: String,
    pub tg_account_filter: String,
    pub review_content: String,
    pub review_url: String,
    pub reviewer_id: String,
    pub reviewer_id_filter: String,
    pub order: String,
    pub replies: String,
    pub magazine_title: String,
    pub sub_title: String,
    pub slug: String,
    pub curator: String,
    pub preface: String,
    pub banner: String,
}

impl Default for NotionProperties {
    fn default() -> Self {
        Self {
            status: "Status".to_string(),
            published_status: "Published".to_string(),
            magazines_relation: "Magazines".to_string(),
            tg_link: "TG Link（必填）".to_string(),
            tg_link_filter: "rgd%7C".to_string(),
            review_title: "分享内容标题（非必填）".to_string(),
            tg_account: "TG account".to_string(),
            tg_account_filter: "TG account".to_string(),
            review_content: "分享者推荐语（若未填写，内容从TG解析，可编辑更新）".to_string(),
            review_url: "分享内容URL（若未填写，内容从TG解析）".to_string(),
            reviewer_id: "分享者CharacterID".to_string(),
            reviewer_id_filter: "c%3DTq".to_string(),
            order: "排序".to_string(),
            replies: "Replies".to_string(),
            magazine_title: "标题".to_string(),
            sub_title: "副标题".to_string(),
            slug: "自定义网页后缀（不可重复）".to_string(),
            curator: "策展人".to_string(),
            preface: "策展前言/导语".to_string(),
            banner: "banner".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when no path is given.
    #[instrument(level = "info")]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!("No settings file given; using defaults");
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)?;
        let settings = Self::from_yaml(&text)?;
        info!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

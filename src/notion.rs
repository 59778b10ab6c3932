//! Notion content source.
//!
//! Two databases drive the sync:
//!
//! - **Magazines**: one page per magazine issue; only `Published` ones count.
//! - **Magazine contents**: one page per shared Telegram message, related to
//!   its magazine, carrying the sharer's character id and Telegram account
//!   as rollups plus optional review overrides and an order.
//!
//! Pages are read through the database query endpoint, following
//! `next_cursor` until `has_more` is false. Property access is ad hoc: a
//! property that is missing or of the wrong type yields
//! [`Error::Property`] naming it.

use crate::error::{Error, Result};
use crate::ipfs::IpfsUploader;
use crate::models::{ContentItem, Magazine, NotionPage};
use crate::settings::{NotionProperties, NotionSettings};
use crate::store::StringMap;
use crate::utils::truncate_for_log;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<NotionPage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

fn property<'a>(page: &'a NotionPage, name: &str) -> Result<&'a Value> {
    page.properties
        .get(name)
        .ok_or_else(|| Error::property(name, "is missing"))
}

/// Fail unless property `name` is of Notion type `kind`.
fn expect_kind<'a>(page: &'a NotionPage, name: &str, kind: &str) -> Result<&'a Value> {
    let value = property(page, name)?;
    value
        .get(kind)
        .ok_or_else(|| Error::property(name, format!("is not {kind}")))
}

/// `plain_text` of the first fragment of a rich-text array.
fn first_plain_text(fragments: &Value) -> Option<String> {
    fragments
        .get(0)?
        .get("plain_text")?
        .as_str()
        .map(str::to_string)
}

/// All `plain_text` fragments of a rich-text array, joined.
fn joined_plain_text(fragments: &Value) -> String {
    fragments
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn required_text(page: &NotionPage, name: &str, kind: &str) -> Result<String> {
    first_plain_text(expect_kind(page, name, kind)?).ok_or_else(|| Error::property(name, "is empty"))
}

/// Id of the first related magazine.
pub fn magazine_id(page: &NotionPage, props: &NotionProperties) -> Result<String> {
    expect_kind(page, &props.magazines_relation, "relation")?
        .get(0)
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::property(&props.magazines_relation, "has no relation"))
}

/// Build a [`Magazine`] from its page. `banner` holds the original file URL.
pub fn magazine_from_page(page: &NotionPage, props: &NotionProperties) -> Result<Magazine> {
    let banner_files = expect_kind(page, &props.banner, "files")?;
    let banner = banner_files
        .get(0)
        .and_then(|f| f.get("file").or_else(|| f.get("external")))
        .and_then(|f| f.get("url"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::property(&props.banner, "has no file"))?
        .to_string();

    Ok(Magazine {
        title: required_text(page, &props.magazine_title, "title")?,
        subTitle: required_text(page, &props.sub_title, "rich_text")?,
        slug: required_text(page, &props.slug, "rich_text")?,
        curator: required_text(page, &props.curator, "rich_text")?,
        preface: joined_plain_text(expect_kind(page, &props.preface, "rich_text")?),
        banner,
        uid: page.id.clone(),
    })
}

/// Normalize a magazine content page.
pub fn get_properties(page: &NotionPage, props: &NotionProperties) -> Result<ContentItem> {
    let title_text = expect_kind(page, &props.review_title, "rich_text")?;
    let tg_link = expect_kind(page, &props.tg_link, "url")?;
    let tg_account = expect_kind(page, &props.tg_account, "rollup")?;
    let review_text = expect_kind(page, &props.review_content, "rich_text")?;
    let review_url = expect_kind(page, &props.review_url, "url")?;
    let reviewer = expect_kind(page, &props.reviewer_id, "rollup")?;
    let order = expect_kind(page, &props.order, "title")?;

    let tg_url = tg_link
        .as_str()
        .ok_or_else(|| Error::property(&props.tg_link, "is empty"))?
        .to_string();

    let author_id = reviewer
        .get("array")
        .and_then(|a| a.get(0))
        .and_then(|item| item.get("rich_text"))
        .and_then(first_plain_text)
        .ok_or_else(|| Error::property(&props.reviewer_id, "has no character id"))?;

    let author_tg_account = tg_account
        .get("array")
        .and_then(|a| a.get(0))
        .and_then(|item| item.get("url"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::property(&props.tg_account, "has no account url"))?
        .to_string();

    let replies = page
        .properties
        .get(&props.replies)
        .and_then(|p| p.get("rich_text"))
        .map(joined_plain_text)
        .filter(|r| !r.is_empty());

    Ok(ContentItem {
        page_id: page.id.clone(),
        title: first_plain_text(title_text),
        tg_url,
        author_id,
        author_tg_account,
        notion_review: first_plain_text(review_text),
        notion_review_url: review_url.as_str().map(str::to_string),
        order: first_plain_text(order)
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| "0".to_string()),
        replies,
        magazine_id: magazine_id(page, props)?,
    })
}

/// Keep pages edited at or after the last update of their magazine.
///
/// Magazines without a recorded (or parsable) last update start at the epoch.
pub fn edited_since(pages: Vec<NotionPage>, last_updates: &StringMap, props: &NotionProperties) -> Vec<NotionPage> {
    pages
        .into_iter()
        .filter(|page| {
            let Ok(id) = magazine_id(page, props) else {
                warn!(page = %page.id, "Content page has no magazine; skipping");
                return false;
            };
            let since = last_updates
                .get(&id)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            page.last_edited_time >= since
        })
        .collect()
}

/// Query filter selecting complete content rows of the given magazines.
pub fn content_filter(magazine_ids: &[String], props: &NotionProperties) -> Value {
    let every_not_empty = json!({ "every": { "rich_text": { "is_not_empty": true } } });
    let related: Vec<Value> = magazine_ids
        .iter()
        .map(|id| json!({ "property": props.magazines_relation, "relation": { "contains": id } }))
        .collect();
    json!({
        "and": [
            { "property": props.tg_link_filter, "url": { "is_not_empty": true } },
            { "property": props.reviewer_id_filter, "rollup": every_not_empty },
            { "property": props.tg_account_filter, "rollup": every_not_empty },
            { "or": related },
        ]
    })
}

/// Notion REST API client.
#[derive(Clone)]
pub struct NotionClient {
    client: Client,
    api_key: String,
    settings: NotionSettings,
}

impl fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClient")
            .field("api_base", &self.settings.api_base)
            .field("api_version", &self.settings.api_version)
            .finish()
    }
}

impl NotionClient {
    pub fn new(client: Client, api_key: impl Into<String>, settings: NotionSettings) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            settings,
        }
    }

    pub fn properties(&self) -> &NotionProperties {
        &self.settings.properties
    }

    /// Run a database query, following pagination to the end.
    #[instrument(level = "info", skip(self, filter))]
    pub async fn query_database(&self, database_id: &str, filter: Value) -> Result<Vec<NotionPage>> {
        let url = format!(
            "{}/databases/{}/query",
            self.settings.api_base.trim_end_matches('/'),
            database_id
        );
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = json!({ "filter": filter });
            if let Some(c) = &cursor {
                body["start_cursor"] = Value::from(c.as_str());
            }
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .header("Notion-Version", &self.settings.api_version)
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::Remote {
                    service: "notion",
                    status: status.as_u16(),
                    body: truncate_for_log(&response.text().await.unwrap_or_default(), 500),
                });
            }
            let page: QueryResponse = response.json().await?;
            debug!(results = page.results.len(), has_more = page.has_more, "Fetched query page");
            pages.extend(page.results);

            match (page.has_more, page.next_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }

        info!(count = pages.len(), "Queried database");
        Ok(pages)
    }

    /// Published magazines, with banners re-hosted on IPFS.
    #[instrument(level = "info", skip_all)]
    pub async fn query_magazines(&self, ipfs: &IpfsUploader) -> Result<(Vec<String>, Vec<Magazine>)> {
        let props = self.properties();
        let filter = json!({
            "property": props.status,
            "status": { "equals": props.published_status },
        });
        let pages = self.query_database(&self.settings.magazine_db_id, filter).await?;

        let mut magazines = Vec::with_capacity(pages.len());
        for page in &pages {
            let mut magazine = magazine_from_page(page, props)?;
            magazine.banner = ipfs.upload_by_url(&magazine.banner).await?.web2url;
            magazines.push(magazine);
        }
        let ids = pages.into_iter().map(|p| p.id).collect();
        Ok((ids, magazines))
    }

    /// Content rows of `magazine_ids` edited since their magazine's last update.
    #[instrument(level = "info", skip_all, fields(magazines = magazine_ids.len()))]
    pub async fn query_magazine_contents(
        &self,
        magazine_ids: &[String],
        last_updates: &StringMap,
    ) -> Result<Vec<NotionPage>> {
        if magazine_ids.is_empty() {
            info!("No magazines to query contents for");
            return Ok(Vec::new());
        }
        let props = self.properties();
        let pages = self
            .query_database(&self.settings.magazine_content_db_id, content_filter(magazine_ids, props))
            .await?;
        let total = pages.len();
        let pages = edited_since(pages, last_updates, props);
        info!(total, changed = pages.len(), "Filtered contents by last update");
        Ok(pages)
    }
}

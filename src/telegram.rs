//! Telegram message preview scraper.
//!
//! Public Telegram messages can be rendered as an embeddable widget
//! (`https://t.me/<chat>/<id>?embed=1&mode=tme`), a small static HTML page
//! that carries the author link, the message text and its date. That is all
//! a share needs, so no Telegram API access is required.
//!
//! Message links also identify shares locally: the *message key*
//! `"{context_group_id}-{message_id}"` maps to the Nomland share created for
//! that message (see the `nunti-idMap` table in [`crate::store`]).

use crate::error::Result;
use crate::models::RawContent;
use crate::store::StringMap;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument};

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(http|https)://[^\s]+").expect("valid url regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"#[^\s]+").expect("valid tag regex"));
static NUMERIC_SEGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\d+").expect("valid segment regex"));

/// What the widget page shows, before any cleanup.
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub author_url: Option<String>,
    pub text: Option<String>,
    pub publish_date: DateTime<Utc>,
}

/// Build the embeddable widget URL for a message link.
///
/// A trailing `/` is dropped, then the first numeric path segment (the forum
/// topic of `t.me/<group>/<topic>/<message>` links) is removed.
pub fn embed_url(url: &str) -> String {
    let url = url.strip_suffix('/').unwrap_or(url);
    let url = NUMERIC_SEGMENT_RE.replacen(url, 1, "");
    format!("{url}?embed=1&mode=tme")
}

/// Extract author, text and date from a widget page.
///
/// `now` is used when the page carries no (valid) date.
pub fn parse_preview(html: &str, now: DateTime<Utc>) -> Preview {
    let document = Html::parse_document(html);
    let author_selector = Selector::parse(".tgme_widget_message_author_name").unwrap();
    let text_selector = Selector::parse(".tgme_widget_message_text.js-message_text").unwrap();
    let date_selector = Selector::parse(".tgme_widget_message_date > time").unwrap();

    let author_url = document
        .select(&author_selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(str::to_string);

    let text = document
        .select(&text_selector)
        .next()
        .map(|el| el.text().collect::<String>());

    let publish_date = document
        .select(&date_selector)
        .next()
        .and_then(|el| el.value().attr("datetime"))
        .and_then(|dt| DateTime::parse_from_rfc3339(dt).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now);

    Preview {
        author_url,
        text,
        publish_date,
    }
}

/// First `http(s)://` URL in `text`.
pub fn get_first_url(text: &str) -> Option<String> {
    URL_RE.find(text).map(|m| m.as_str().to_string())
}

/// Strip URLs, `@bot_name` mentions and hashtags, then trim.
pub fn clean_content(text: &str, bot_name: &str) -> String {
    let without_urls = URL_RE.replace_all(text, "");
    let without_bot = without_urls.replace(&format!("@{bot_name}"), "");
    TAG_RE.replace_all(&without_bot, "").trim().to_string()
}

/// Turn a parsed [`Preview`] into [`RawContent`].
///
/// Content and entity URL are only derived when both the author and the
/// text are present.
pub fn raw_content_from_preview(preview: Preview, bot_name: &str) -> RawContent {
    let Preview {
        author_url,
        text,
        publish_date,
    } = preview;

    let (content, entity_url) = match (&author_url, &text) {
        (Some(_), Some(text)) => (Some(clean_content(text, bot_name)), get_first_url(text)),
        _ => (None, None),
    };

    RawContent {
        author_url,
        publish_date,
        content,
        entity_url,
        raw_text: text,
    }
}

/// `"{context_group_id}-{last path segment}"` of a message link.
pub fn msg_key(url: &str, context_group_id: &str) -> String {
    let url = url.strip_suffix('/').unwrap_or(url);
    let message_id = url.rsplit('/').next().unwrap_or(url);
    format!("{context_group_id}-{message_id}")
}

/// Look up the share previously created for a message link.
///
/// Returns the share id (if any) and the message key it is stored under.
pub fn note_id_from_url(url: &str, context_group_id: &str, id_map: &StringMap) -> (Option<String>, String) {
    let key = msg_key(url, context_group_id);
    (id_map.get(&key).cloned(), key)
}

/// Source of message previews.
pub trait PreviewSource {
    async fn get_raw_content(&self, url: &str) -> Result<RawContent>;
}

/// Fetches and parses message previews from `t.me`.
#[derive(Debug, Clone)]
pub struct TelegramScraper {
    client: Client,
    bot_name: String,
}

impl TelegramScraper {
    pub fn new(client: Client, bot_name: impl Into<String>) -> Self {
        Self {
            client,
            bot_name: bot_name.into(),
        }
    }
}

impl PreviewSource for TelegramScraper {
    /// Scrape the preview page of a message link.
    #[instrument(level = "info", skip(self))]
    async fn get_raw_content(&self, url: &str) -> Result<RawContent> {
        let embed = embed_url(url);
        let html = self
            .client
            .get(&embed)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        debug!(%embed, bytes = html.len(), "Fetched Telegram preview");

        let raw = raw_content_from_preview(parse_preview(&html, Utc::now()), &self.bot_name);
        info!(
            author = ?raw.author_url,
            has_content = raw.content.is_some(),
            entity_url = ?raw.entity_url,
            "Parsed Telegram preview"
        );
        Ok(raw)
    }
}

//! Metadata extraction for shared pages ("entities").
//!
//! Prefers OpenGraph tags and falls back to plain `<meta name=...>` tags and
//! the document `<title>`.

use crate::models::Entity;
use scraper::{Html, Selector};

fn meta(document: &Html, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        let selector = Selector::parse(&format!(
            r#"meta[property="{key}"], meta[name="{key}"]"#
        ))
        .ok()?;
        document
            .select(&selector)
            .filter_map(|el| el.value().attr("content"))
            .map(str::trim)
            .find(|content| !content.is_empty())
            .map(str::to_string)
    })
}

/// Build an [`Entity`] for `url` from the page's HTML.
pub fn parse_entity(html: &str, url: &str) -> Entity {
    let document = Html::parse_document(html);
    let title_selector = Selector::parse("title").unwrap();

    let title = meta(&document, &["og:title", "twitter:title"]).or_else(|| {
        document
            .select(&title_selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    });

    Entity {
        url: url.to_string(),
        title,
        description: meta(&document, &["og:description", "twitter:description", "description"]),
        image: meta(&document, &["og:image", "twitter:image"]),
        published: meta(&document, &["article:published_time", "og:published_time", "date"]),
        source: meta(&document, &["og:site_name", "application-name"]),
    }
}

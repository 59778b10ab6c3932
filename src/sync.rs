//! The synchronization run.
//!
//! One run goes through these steps:
//! 1. **Setup**: load local state, query published magazines (re-hosting
//!    banners on IPFS), write the magazine list, query the contents edited
//!    since each magazine's last update, and advance the last-update marks.
//! 2. **Items**: for every content row, scrape its Telegram preview, build
//!    the share it should be, and create or edit the remote share. Failures
//!    are logged per item and never stop the run.
//! 3. **Feeds**: rebuild each magazine's `orders-` and `content-` files from
//!    the shares in order, attaching replies.
//!
//! With `dry_run` set, remote writes are only logged and step 3 is skipped.

use crate::error::{Error, Result};
use crate::ipfs::IpfsUploader;
use crate::models::{ContentItem, Magazine, NoteKey, NotionPage, RawContent, ShareDetails, ShareInput, ShareNote};
use crate::nomland::{SharesPage, ShareService, note_key_of};
use crate::notion::{NotionClient, get_properties};
use crate::settings::NotionProperties;
use crate::store::{ApiStore, KeyValueStore, StringMap, get_map_value};
use crate::telegram::{PreviewSource, note_id_from_url};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, instrument, warn};

/// Table mapping Telegram message keys to share ids.
pub const ID_MAP_TABLE: &str = "nunti-idMap";
/// Table holding last-update timestamps.
pub const CONFIG_TABLE: &str = "colib-magazine-config";

const LAST_UPDATE_KEY: &str = "magazineLastUpdate";
const LAST_UPDATES_KEY: &str = "magazineLastUpdates";

const CURATION_RECORD_TRAIT: &str = "curation record";
const ENTITY_ID_TRAIT: &str = "entity id";

/// Who publishes, and how.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncContext {
    /// Character id of the publishing context.
    pub context_id: String,
    /// Display name, listed among a share's sources.
    pub context_name: String,
    /// Prefix of message keys.
    pub context_group_id: String,
    pub dry_run: bool,
}

/// `toISOString()`-style timestamp, e.g. `2024-03-05T10:20:30.000Z`.
pub fn iso_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// What setup hands to the item and feed steps.
#[derive(Debug)]
pub struct Prepared {
    pub magazines: Vec<Magazine>,
    pub contents: Vec<NotionPage>,
    /// Message key to share id, as loaded from disk.
    pub id_map: StringMap,
}

/// Load local state and query everything this run has to look at.
#[instrument(level = "info", skip_all, fields(dry_run = context.dry_run))]
pub async fn setup(
    context: &SyncContext,
    notion: &NotionClient,
    ipfs: &IpfsUploader,
    kv: &KeyValueStore,
    api: &ApiStore,
) -> Result<Prepared> {
    let mut id_map = StringMap::new();
    let mut config = StringMap::new();
    kv.load_key_value_pairs(&mut id_map, Some(ID_MAP_TABLE)).await?;
    kv.load_key_value_pairs(&mut config, Some(CONFIG_TABLE)).await?;

    let last_update = config
        .get(LAST_UPDATE_KEY)
        .cloned()
        .unwrap_or_else(|| iso_timestamp(DateTime::<Utc>::UNIX_EPOCH));
    let (last_updates, mut new_last_updates) = get_map_value(&config, LAST_UPDATES_KEY)?;
    info!(%last_update, ?last_updates, "Loaded last update times");

    let now = iso_timestamp(Utc::now());

    let (magazine_ids, magazines) = notion.query_magazines(ipfs).await?;
    api.store_magazine_list(&magazines).await?;
    info!(?magazine_ids, "Magazines queried");

    let contents = notion.query_magazine_contents(&magazine_ids, &last_updates).await?;
    info!(count = contents.len(), "Magazine contents to process");

    if context.dry_run {
        info!("Dry run: last update times not advanced");
    } else {
        for id in &magazine_ids {
            new_last_updates.insert(id.clone(), now.clone());
        }
        kv.set_key_value(
            LAST_UPDATES_KEY,
            &serde_json::to_string(&new_last_updates)?,
            Some(CONFIG_TABLE),
        )
        .await?;
        kv.set_key_value(LAST_UPDATE_KEY, &now, Some(CONFIG_TABLE)).await?;
    }

    Ok(Prepared {
        magazines,
        contents,
        id_map,
    })
}

/// The share a content row should be, given what its Telegram message says.
///
/// Review text and URL entered in Notion win over what was scraped; a share
/// without any entity URL cannot be built.
pub fn build_share_input(item: &ContentItem, raw: &RawContent, context: &SyncContext) -> Result<ShareInput> {
    let non_empty = |s: &Option<String>| s.clone().filter(|s| !s.is_empty());

    let content = non_empty(&item.notion_review)
        .or_else(|| non_empty(&raw.content))
        .unwrap_or_default();
    let entity_url = non_empty(&item.notion_review_url)
        .or_else(|| non_empty(&raw.entity_url))
        .ok_or_else(|| Error::NoEntityUrl(item.tg_url.clone()))?;

    Ok(ShareInput {
        author: item.author_id.clone(),
        context: context.context_id.clone(),
        details: ShareDetails {
            content,
            title: non_empty(&item.title),
            sources: vec!["Telegram".to_string(), context.context_name.clone()],
            external_url: item.tg_url.clone(),
            submitted_by: context.context_id.clone(),
            raw_content: raw.raw_text.iter().cloned().collect(),
            date_published: iso_timestamp(raw.publish_date),
        },
        entity_url,
    })
}

/// True when the published share already matches `input`.
pub fn is_unchanged(share: &ShareNote, input: &ShareInput) -> bool {
    let old = &share.note.details;
    old.content.as_deref() == Some(input.details.content.as_str())
        && old.title == input.details.title
        && old.date_published.as_deref() == Some(input.details.date_published.as_str())
        && old.external_url.as_deref() == Some(input.details.external_url.as_str())
        && share.entity.metadata.url.as_deref() == Some(input.entity_url.as_str())
}

/// What happened to one content row.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Created(NoteKey),
    Updated { entity_changed: bool },
    Unchanged,
    /// The id map points at a share the service does not know.
    ShareMissing(NoteKey),
    /// The row belongs to a magazine that is not published.
    UnknownMagazine,
    DryRun,
}

/// Counts per outcome, for the end-of-run log line.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: &Result<ItemOutcome>) {
        match outcome {
            Ok(ItemOutcome::Created(_)) => self.created += 1,
            Ok(ItemOutcome::Updated { .. }) => self.updated += 1,
            Ok(ItemOutcome::Unchanged) => self.unchanged += 1,
            Ok(_) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Pushes content rows to the share service and rebuilds the feeds.
pub struct Syncer<S, P> {
    service: S,
    previews: P,
    kv: KeyValueStore,
    api: ApiStore,
    props: NotionProperties,
    context: SyncContext,
    id_map: StringMap,
}

impl<S, P> Syncer<S, P>
where
    S: ShareService,
    P: PreviewSource,
{
    pub fn new(
        service: S,
        previews: P,
        kv: KeyValueStore,
        api: ApiStore,
        props: NotionProperties,
        context: SyncContext,
        id_map: StringMap,
    ) -> Self {
        Self {
            service,
            previews,
            kv,
            api,
            props,
            context,
            id_map,
        }
    }

    /// Message key to share id, including shares created in this run.
    pub fn id_map(&self) -> &StringMap {
        &self.id_map
    }

    /// Sync every content row in order. Errors are logged and counted.
    #[instrument(level = "info", skip_all, fields(count = contents.len()))]
    pub async fn sync_contents(&mut self, contents: &[NotionPage], magazines: &[Magazine]) -> SyncReport {
        let mut report = SyncReport::default();
        for (index, page) in contents.iter().enumerate() {
            let outcome = self.sync_page(index, page, magazines).await;
            match &outcome {
                Err(e) => error!(index, page = %page.id, error = %e, "Failed to sync content item"),
                Ok(ItemOutcome::Created(key)) => info!(index, share_id = %key, "New share created"),
                Ok(ItemOutcome::Updated { entity_changed }) => info!(index, entity_changed, "Share updated"),
                Ok(ItemOutcome::ShareMissing(key)) => warn!(index, share_id = %key, "Cannot find share"),
                Ok(_) => {}
            }
            report.record(&outcome);
        }
        info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            failed = report.failed,
            "Synced magazine contents"
        );
        report
    }

    #[instrument(level = "info", skip(self, page, magazines), fields(page = %page.id))]
    async fn sync_page(&mut self, index: usize, page: &NotionPage, magazines: &[Magazine]) -> Result<ItemOutcome> {
        let item = get_properties(page, &self.props)?;

        if !magazines.iter().any(|m| m.uid == item.magazine_id) {
            warn!(index, magazine = %item.magazine_id, "Cannot find magazine for item");
            return Ok(ItemOutcome::UnknownMagazine);
        }

        let raw = self.previews.get_raw_content(&item.tg_url).await?;
        if raw.author_url.as_deref() != Some(item.author_tg_account.as_str()) {
            error!(
                index,
                notion = %item.author_tg_account,
                telegram = ?raw.author_url,
                "TG account in Notion does not match the author of the Telegram message"
            );
        }

        let input = build_share_input(&item, &raw, &self.context)?;
        let (share_id, msg_key) = note_id_from_url(&item.tg_url, &self.context.context_group_id, &self.id_map);

        match share_id {
            Some(share_id) => self.update_share(index, share_id.parse()?, &input).await,
            None => self.create_share(index, &msg_key, &input).await,
        }
    }

    async fn update_share(&self, index: usize, key: NoteKey, input: &ShareInput) -> Result<ItemOutcome> {
        let tg_url = &input.details.external_url;
        let Some(share) = self.service.get_share(&key).await? else {
            return Ok(ItemOutcome::ShareMissing(key));
        };

        if is_unchanged(&share, input) {
            info!(index, %tg_url, "No changes found");
            return Ok(ItemOutcome::Unchanged);
        }
        info!(index, %tg_url, "Requiring updates");

        let entity_changed = share.entity.metadata.url.as_deref() != Some(input.entity_url.as_str());
        let mut entity_id = share.entity.id.clone();

        if entity_changed {
            let entity = self.service.parse_entity(&input.entity_url).await?;
            if self.context.dry_run {
                debug!(entity = ?entity, "Parsed entity");
                info!(index, character = %key.character_id, %tg_url, "Dry run: create entity");
            } else {
                entity_id = self.service.create_entity(&entity, &key.character_id).await?;
                info!(index, %entity_id, "Entity updated");
            }
        }

        if self.context.dry_run {
            info!(index, %key, %tg_url, "Dry run: edit note");
            return Ok(ItemOutcome::DryRun);
        }

        let details = input.details.clone();
        self.service
            .edit_note(&key, move |note| {
                note.content = Some(details.content);
                note.title = details.title;
                note.date_published = Some(details.date_published);
                note.external_urls = vec![details.external_url];
                if entity_changed {
                    if let Some(record) = note.attribute_mut(CURATION_RECORD_TRAIT) {
                        record.value = entity_id
                            .parse::<u64>()
                            .map(Value::from)
                            .unwrap_or(Value::Null);
                    }
                    if let Some(record) = note.attribute_mut(ENTITY_ID_TRAIT) {
                        record.value = Value::from(entity_id);
                    }
                }
            })
            .await?;

        Ok(ItemOutcome::Updated { entity_changed })
    }

    async fn create_share(&mut self, index: usize, msg_key: &str, input: &ShareInput) -> Result<ItemOutcome> {
        let tg_url = &input.details.external_url;
        info!(index, %tg_url, "Creating new share");
        if self.context.dry_run {
            info!(index, %tg_url, "Dry run: create share");
            return Ok(ItemOutcome::DryRun);
        }

        let key = self.service.create_share(input).await?;
        let share_id = key.to_string();

        self.id_map.insert(msg_key.to_string(), share_id.clone());
        self.kv.set_key_value(msg_key, &share_id, Some(ID_MAP_TABLE)).await?;
        Ok(ItemOutcome::Created(key))
    }

    /// Rebuild the `orders-` and `content-` files of every magazine.
    #[instrument(level = "info", skip_all, fields(magazines = magazines.len()))]
    pub async fn publish_feeds(&self, contents: &[NotionPage], magazines: &[Magazine]) -> Result<()> {
        if self.context.dry_run {
            info!("Dry run: skip storing magazine orders and replies");
            return Ok(());
        }

        let mut orders_record: HashMap<String, StringMap> = HashMap::new();
        for magazine in magazines {
            let mut orders = StringMap::new();
            match self.api.load_magazine_orders(&mut orders, &magazine.uid).await {
                Ok(()) => {
                    orders_record.insert(magazine.uid.clone(), orders);
                }
                Err(e) => error!(magazine = %magazine.uid, error = %e, "Cannot load magazine orders; skipping feed"),
            }
        }

        let mut replies = StringMap::new();
        for page in contents {
            let item = match get_properties(page, &self.props) {
                Ok(item) => item,
                Err(e) => {
                    warn!(page = %page.id, error = %e, "Skipping item without valid properties");
                    continue;
                }
            };
            let Some(orders) = orders_record.get_mut(&item.magazine_id) else {
                warn!(page = %page.id, "Cannot find magazine orders for item");
                continue;
            };
            let (share_id, _) = note_id_from_url(&item.tg_url, &self.context.context_group_id, &self.id_map);
            match share_id {
                Some(share_id) => {
                    orders.insert(share_id.clone(), item.order.clone());
                    replies.insert(share_id, item.replies.clone().unwrap_or_default());
                }
                None => warn!(page = %page.id, "No share id found for item"),
            }
        }

        let results: Vec<(String, Result<()>)> = stream::iter(magazines)
            .then(|magazine| {
                let orders = orders_record.get(&magazine.uid);
                let replies = &replies;
                async move {
                    let result = match orders {
                        Some(orders) => self.publish_magazine(&magazine.uid, orders, replies).await,
                        None => Ok(()),
                    };
                    (magazine.uid.clone(), result)
                }
            })
            .collect()
            .await;

        for (uid, result) in results {
            if let Err(e) = result {
                error!(magazine = %uid, error = %e, "Failed to publish magazine feed");
            }
        }
        Ok(())
    }

    async fn publish_magazine(&self, uid: &str, orders: &StringMap, replies: &StringMap) -> Result<()> {
        self.api.store_magazine_orders(uid, orders).await?;

        let keys = sorted_keys(orders)?;
        let mut page = if keys.is_empty() {
            SharesPage::default()
        } else {
            self.service.get_shares(&keys).await?
        };
        attach_replies(&mut page, replies);

        self.api
            .store_magazine_content(uid, &serde_json::to_string_pretty(&page)?)
            .await?;
        info!(magazine = %uid, notes = page.notes.len(), "Stored magazine content");
        Ok(())
    }
}

/// Share keys in ascending numeric order; unparsable orders count as 0.
pub fn sorted_keys(orders: &BTreeMap<String, String>) -> Result<Vec<NoteKey>> {
    orders
        .iter()
        .sorted_by(|(_, a), (_, b)| {
            let a = a.trim().parse::<f64>().unwrap_or(0.0);
            let b = b.trim().parse::<f64>().unwrap_or(0.0);
            a.total_cmp(&b)
        })
        .map(|(key, _)| key.parse::<NoteKey>())
        .collect()
}

/// Set `replies` on every note that has a non-empty reply recorded.
pub fn attach_replies(page: &mut SharesPage, replies: &StringMap) {
    for note in page.notes.iter_mut() {
        let Some(key) = note_key_of(note) else { continue };
        if let (Some(reply), Some(obj)) = (replies.get(&key), note.as_object_mut()) {
            if !reply.is_empty() {
                obj.insert("replies".to_string(), Value::from(reply.as_str()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, EntityMetadata, EntityRecord, NoteAttribute, NoteDetails, NoteMetadata, ShareNoteBody};
    use crate::settings::NotionSettings;
    use chrono::TimeZone;
    use reqwest::Client;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context(dry_run: bool) -> SyncContext {
        SyncContext {
            context_id: "100".to_string(),
            context_name: "Colib".to_string(),
            context_group_id: "g".to_string(),
            dry_run,
        }
    }

    fn published() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 20, 30).unwrap()
    }

    fn raw(entity_url: Option<&str>) -> RawContent {
        RawContent {
            author_url: Some("https://t.me/alice".to_string()),
            publish_date: published(),
            content: Some("scraped review".to_string()),
            entity_url: entity_url.map(str::to_string),
            raw_text: Some("scraped review https://example.com/a".to_string()),
        }
    }

    fn item() -> ContentItem {
        ContentItem {
            page_id: "page-1".to_string(),
            title: Some("A title".to_string()),
            tg_url: "https://t.me/group/1/42".to_string(),
            author_id: "52055".to_string(),
            author_tg_account: "https://t.me/alice".to_string(),
            notion_review: None,
            notion_review_url: None,
            order: "2".to_string(),
            replies: Some("great".to_string()),
            magazine_id: "mag-1".to_string(),
        }
    }

    fn content_page(id: &str, tg_url: &str, order: &str, magazine: &str) -> NotionPage {
        let p = NotionProperties::default();
        let mut properties = serde_json::Map::new();
        properties.insert(p.review_title.clone(), json!({ "rich_text": [{ "plain_text": "A title" }] }));
        properties.insert(p.tg_link.clone(), json!({ "url": tg_url }));
        properties.insert(
            p.tg_account.clone(),
            json!({ "rollup": { "array": [{ "url": "https://t.me/alice" }] } }),
        );
        properties.insert(p.review_content.clone(), json!({ "rich_text": [] }));
        properties.insert(p.review_url.clone(), json!({ "url": null }));
        properties.insert(
            p.reviewer_id.clone(),
            json!({ "rollup": { "array": [{ "rich_text": [{ "plain_text": "52055" }] }] } }),
        );
        properties.insert(p.order.clone(), json!({ "title": [{ "plain_text": order }] }));
        properties.insert(p.replies.clone(), json!({ "rich_text": [{ "plain_text": "reply" }] }));
        properties.insert(p.magazines_relation.clone(), json!({ "relation": [{ "id": magazine }] }));
        NotionPage {
            id: id.to_string(),
            last_edited_time: published(),
            properties,
        }
    }

    fn magazine(uid: &str) -> Magazine {
        Magazine {
            title: "Issue".to_string(),
            subTitle: String::new(),
            slug: uid.to_string(),
            curator: String::new(),
            preface: String::new(),
            banner: String::new(),
            uid: uid.to_string(),
        }
    }

    fn share_matching(input: &ShareInput) -> ShareNote {
        ShareNote {
            note: ShareNoteBody {
                key: NoteKey::new("52055", "7"),
                details: NoteDetails {
                    content: Some(input.details.content.clone()),
                    title: input.details.title.clone(),
                    date_published: Some(input.details.date_published.clone()),
                    external_url: Some(input.details.external_url.clone()),
                },
            },
            entity: EntityRecord {
                id: "11".to_string(),
                metadata: EntityMetadata {
                    url: Some(input.entity_url.clone()),
                },
            },
        }
    }

    struct FakePreviews;

    impl PreviewSource for FakePreviews {
        async fn get_raw_content(&self, _url: &str) -> Result<RawContent> {
            Ok(raw(Some("https://example.com/a")))
        }
    }

    #[derive(Default)]
    struct FakeService {
        shares: Mutex<HashMap<String, ShareNote>>,
        metadata: Mutex<NoteMetadata>,
        created: Mutex<Vec<ShareInput>>,
        edited: Mutex<Vec<NoteKey>>,
        entities: Mutex<Vec<String>>,
        batch_requests: Mutex<Vec<Vec<NoteKey>>>,
    }

    impl ShareService for FakeService {
        async fn get_share(&self, key: &NoteKey) -> Result<Option<ShareNote>> {
            Ok(self.shares.lock().unwrap().get(&key.to_string()).cloned())
        }

        async fn get_shares(&self, keys: &[NoteKey]) -> Result<SharesPage> {
            self.batch_requests.lock().unwrap().push(keys.to_vec());
            Ok(SharesPage {
                notes: keys.iter().map(|k| json!({ "key": k })).collect(),
                rest: serde_json::Map::new(),
            })
        }

        async fn create_share(&self, input: &ShareInput) -> Result<NoteKey> {
            let mut created = self.created.lock().unwrap();
            created.push(input.clone());
            Ok(NoteKey::new("52055", created.len().to_string()))
        }

        async fn edit_note<F>(&self, key: &NoteKey, edit: F) -> Result<()>
        where
            F: FnOnce(&mut NoteMetadata) + Send,
        {
            edit(&mut self.metadata.lock().unwrap());
            self.edited.lock().unwrap().push(key.clone());
            Ok(())
        }

        async fn create_entity(&self, entity: &Entity, _character_id: &str) -> Result<String> {
            self.entities.lock().unwrap().push(entity.url.clone());
            Ok("99".to_string())
        }

        async fn parse_entity(&self, url: &str) -> Result<Entity> {
            Ok(Entity {
                url: url.to_string(),
                ..Entity::default()
            })
        }
    }

    fn syncer(
        dir: &std::path::Path,
        service: FakeService,
        dry_run: bool,
        id_map: StringMap,
    ) -> Syncer<FakeService, FakePreviews> {
        Syncer::new(
            service,
            FakePreviews,
            KeyValueStore::new(dir),
            ApiStore::new(dir.join("api")),
            NotionProperties::default(),
            context(dry_run),
            id_map,
        )
    }

    #[test]
    fn test_build_share_input_prefers_notion_overrides() {
        let mut item = item();
        item.notion_review = Some("notion review".to_string());
        item.notion_review_url = Some("https://example.com/notion".to_string());
        let input = build_share_input(&item, &raw(Some("https://example.com/a")), &context(false)).unwrap();
        assert_eq!(input.details.content, "notion review");
        assert_eq!(input.entity_url, "https://example.com/notion");
        assert_eq!(input.details.sources, vec!["Telegram", "Colib"]);
        assert_eq!(input.details.date_published, "2024-03-05T10:20:30.000Z");
        assert_eq!(input.details.submitted_by, "100");
        assert_eq!(input.author, "52055");
    }

    #[test]
    fn test_build_share_input_falls_back_to_scraped() {
        let input = build_share_input(&item(), &raw(Some("https://example.com/a")), &context(false)).unwrap();
        assert_eq!(input.details.content, "scraped review");
        assert_eq!(input.entity_url, "https://example.com/a");
        assert_eq!(input.details.raw_content.len(), 1);
    }

    #[test]
    fn test_build_share_input_requires_entity_url() {
        let err = build_share_input(&item(), &raw(None), &context(false)).unwrap_err();
        assert!(matches!(err, Error::NoEntityUrl(url) if url == "https://t.me/group/1/42"));
    }

    #[test]
    fn test_is_unchanged() {
        let input = build_share_input(&item(), &raw(Some("https://example.com/a")), &context(false)).unwrap();
        let mut share = share_matching(&input);
        assert!(is_unchanged(&share, &input));

        share.note.details.title = None;
        assert!(!is_unchanged(&share, &input));

        let mut share = share_matching(&input);
        share.entity.metadata.url = Some("https://example.com/other".to_string());
        assert!(!is_unchanged(&share, &input));
    }

    #[test]
    fn test_sorted_keys_orders_numerically() {
        let orders = StringMap::from([
            ("1-10".to_string(), "10".to_string()),
            ("1-2".to_string(), "2".to_string()),
            ("1-3".to_string(), "abc".to_string()),
        ]);
        let keys: Vec<String> = sorted_keys(&orders).unwrap().iter().map(NoteKey::to_string).collect();
        assert_eq!(keys, vec!["1-3", "1-2", "1-10"]);
    }

    #[test]
    fn test_attach_replies() {
        let mut page = SharesPage {
            notes: vec![
                json!({ "key": { "characterId": "1", "noteId": "2" } }),
                json!({ "key": { "characterId": "1", "noteId": "3" } }),
            ],
            rest: serde_json::Map::new(),
        };
        let replies = StringMap::from([
            ("1-2".to_string(), "hi".to_string()),
            ("1-3".to_string(), String::new()),
        ]);
        attach_replies(&mut page, &replies);
        assert_eq!(page.notes[0]["replies"], "hi");
        assert!(page.notes[1].get("replies").is_none());
    }

    #[tokio::test]
    async fn test_new_item_creates_share_and_records_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut syncer = syncer(dir.path(), FakeService::default(), false, StringMap::new());
        let pages = vec![content_page("p1", "https://t.me/group/1/42", "1", "mag-1")];

        let report = syncer.sync_contents(&pages, &[magazine("mag-1")]).await;
        assert_eq!(report.created, 1);
        assert_eq!(syncer.id_map().get("g-42").map(String::as_str), Some("52055-1"));

        let mut stored = StringMap::new();
        KeyValueStore::new(dir.path())
            .load_key_value_pairs(&mut stored, Some(ID_MAP_TABLE))
            .await
            .unwrap();
        assert_eq!(stored.get("g-42").map(String::as_str), Some("52055-1"));
    }

    #[tokio::test]
    async fn test_unchanged_share_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let service = FakeService::default();
        let input = build_share_input(&item(), &raw(Some("https://example.com/a")), &context(false)).unwrap();
        service
            .shares
            .lock()
            .unwrap()
            .insert("52055-7".to_string(), share_matching(&input));
        let id_map = StringMap::from([("g-42".to_string(), "52055-7".to_string())]);
        let mut syncer = syncer(dir.path(), service, false, id_map);

        let pages = vec![content_page("p1", "https://t.me/group/1/42", "1", "mag-1")];
        let report = syncer.sync_contents(&pages, &[magazine("mag-1")]).await;
        assert_eq!(report.unchanged, 1);
        assert!(syncer.service.edited.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changed_entity_creates_entity_and_edits_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let service = FakeService::default();
        let input = build_share_input(&item(), &raw(Some("https://example.com/a")), &context(false)).unwrap();
        let mut share = share_matching(&input);
        share.entity.metadata.url = Some("https://example.com/old".to_string());
        service.shares.lock().unwrap().insert("52055-7".to_string(), share);
        *service.metadata.lock().unwrap() = NoteMetadata {
            attributes: Some(vec![
                NoteAttribute {
                    trait_type: CURATION_RECORD_TRAIT.to_string(),
                    value: json!(11),
                },
                NoteAttribute {
                    trait_type: ENTITY_ID_TRAIT.to_string(),
                    value: json!("11"),
                },
            ]),
            ..NoteMetadata::default()
        };
        let id_map = StringMap::from([("g-42".to_string(), "52055-7".to_string())]);
        let mut syncer = syncer(dir.path(), service, false, id_map);

        let pages = vec![content_page("p1", "https://t.me/group/1/42", "1", "mag-1")];
        let report = syncer.sync_contents(&pages, &[magazine("mag-1")]).await;
        assert_eq!(report.updated, 1);

        let service = &syncer.service;
        assert_eq!(*service.entities.lock().unwrap(), vec!["https://example.com/a"]);
        let metadata = service.metadata.lock().unwrap();
        assert_eq!(metadata.external_urls, vec!["https://t.me/group/1/42"]);
        assert_eq!(metadata.date_published.as_deref(), Some("2024-03-05T10:20:30.000Z"));
        let attrs = metadata.attributes.as_ref().unwrap();
        assert_eq!(attrs[0].value, json!(99));
        assert_eq!(attrs[1].value, json!("99"));
    }

    #[tokio::test]
    async fn test_missing_share_and_unknown_magazine_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let id_map = StringMap::from([("g-42".to_string(), "52055-7".to_string())]);
        let mut syncer = syncer(dir.path(), FakeService::default(), false, id_map);
        let pages = vec![
            content_page("p1", "https://t.me/group/1/42", "1", "mag-1"),
            content_page("p2", "https://t.me/group/1/43", "1", "mag-unknown"),
        ];
        let report = syncer.sync_contents(&pages, &[magazine("mag-1")]).await;
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_bad_item_does_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut syncer = syncer(dir.path(), FakeService::default(), false, StringMap::new());
        let mut broken = content_page("p1", "https://t.me/group/1/41", "1", "mag-1");
        broken.properties.remove(&NotionProperties::default().order);
        let pages = vec![broken, content_page("p2", "https://t.me/group/1/42", "1", "mag-1")];
        let report = syncer.sync_contents(&pages, &[magazine("mag-1")]).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 1);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut syncer = syncer(dir.path(), FakeService::default(), true, StringMap::new());
        let pages = vec![content_page("p1", "https://t.me/group/1/42", "1", "mag-1")];
        let report = syncer.sync_contents(&pages, &[magazine("mag-1")]).await;
        assert_eq!(report.skipped, 1);
        assert!(syncer.service.created.lock().unwrap().is_empty());

        syncer.publish_feeds(&pages, &[magazine("mag-1")]).await.unwrap();
        assert!(!dir.path().join("api").exists());
    }

    #[tokio::test]
    async fn test_publish_feeds_writes_orders_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let id_map = StringMap::from([
            ("g-42".to_string(), "52055-7".to_string()),
            ("g-43".to_string(), "52055-8".to_string()),
        ]);
        let syncer = syncer(dir.path(), FakeService::default(), false, id_map);
        let pages = vec![
            content_page("p1", "https://t.me/group/1/42", "5", "mag-1"),
            content_page("p2", "https://t.me/group/1/43", "1", "mag-1"),
            content_page("p3", "https://t.me/group/1/44", "1", "mag-1"),
        ];
        syncer.publish_feeds(&pages, &[magazine("mag-1"), magazine("mag-2")]).await.unwrap();

        let api = ApiStore::new(dir.path().join("api"));
        let mut orders = StringMap::new();
        api.load_magazine_orders(&mut orders, "mag-1").await.unwrap();
        assert_eq!(orders.get("52055-7").map(String::as_str), Some("5"));
        assert_eq!(orders.get("52055-8").map(String::as_str), Some("1"));

        let requests = syncer.service.batch_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0], vec![NoteKey::new("52055", "8"), NoteKey::new("52055", "7")]);

        let content: Value =
            serde_json::from_str(&api.read_magazine_content("mag-1").await.unwrap().unwrap()).unwrap();
        assert_eq!(content["notes"][0]["replies"], "reply");

        let empty: Value =
            serde_json::from_str(&api.read_magazine_content("mag-2").await.unwrap().unwrap()).unwrap();
        assert_eq!(empty["notes"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_orders_file_skips_only_its_magazine() {
        let dir = tempfile::tempdir().unwrap();
        let api = ApiStore::new(dir.path().join("api"));
        std::fs::create_dir_all(dir.path().join("api/magazines")).unwrap();
        std::fs::write(api.orders_path("mag-bad"), "{not json").unwrap();

        let id_map = StringMap::from([
            ("g-42".to_string(), "52055-7".to_string()),
            ("g-43".to_string(), "52055-8".to_string()),
        ]);
        let syncer = syncer(dir.path(), FakeService::default(), false, id_map);
        let pages = vec![
            content_page("p1", "https://t.me/group/1/42", "1", "mag-bad"),
            content_page("p2", "https://t.me/group/1/43", "1", "mag-1"),
        ];
        syncer
            .publish_feeds(&pages, &[magazine("mag-bad"), magazine("mag-1")])
            .await
            .unwrap();

        assert!(api.read_magazine_content("mag-1").await.unwrap().is_some());
        assert!(api.read_magazine_content("mag-bad").await.unwrap().is_none());
        assert_eq!(std::fs::read_to_string(api.orders_path("mag-bad")).unwrap(), "{not json");
    }

    fn magazine_page(banner_url: &str) -> NotionPage {
        let p = NotionProperties::default();
        let rich = |text: &str| json!({ "rich_text": [{ "plain_text": text }] });
        let mut properties = serde_json::Map::new();
        properties.insert(p.magazine_title.clone(), json!({ "title": [{ "plain_text": "Issue 1" }] }));
        properties.insert(p.sub_title.clone(), rich("Sub"));
        properties.insert(p.slug.clone(), rich("issue-1"));
        properties.insert(p.curator.clone(), rich("bob"));
        properties.insert(p.preface.clone(), rich("Hello"));
        properties.insert(p.banner.clone(), json!({ "files": [{ "file": { "url": banner_url } }] }));
        NotionPage {
            id: "mag-1".to_string(),
            last_edited_time: published(),
            properties,
        }
    }

    /// Notion with one magazine and one content row, and a working IPFS relay.
    async fn mock_sources(server: &MockServer, settings: &NotionSettings) {
        let banner_url = format!("{}/files/banner.png", server.uri());
        Mock::given(method("POST"))
            .and(path(format!("/databases/{}/query", settings.magazine_db_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [magazine_page(&banner_url)],
                "has_more": false
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/databases/{}/query", settings.magazine_content_db_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [content_page("p1", "https://t.me/group/1/42", "1", "mag-1")],
                "has_more": false
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/banner.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"banner".to_vec()))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": "ipfs://bafybanner",
                "web2url": "https://ipfs.example.org/ipfs/bafybanner"
            })))
            .mount(server)
            .await;
    }

    fn sources(server: &MockServer) -> (NotionClient, IpfsUploader) {
        let settings = NotionSettings {
            api_base: server.uri(),
            ..NotionSettings::default()
        };
        (
            NotionClient::new(Client::new(), "token", settings),
            IpfsUploader::new(Client::new(), format!("{}/upload", server.uri())),
        )
    }

    async fn config_table(kv: &KeyValueStore) -> StringMap {
        let mut config = StringMap::new();
        kv.load_key_value_pairs(&mut config, Some(CONFIG_TABLE)).await.unwrap();
        config
    }

    #[tokio::test]
    async fn test_setup_records_last_updates() {
        let server = MockServer::start().await;
        mock_sources(&server, &NotionSettings::default()).await;
        let (notion, ipfs) = sources(&server);
        let dir = tempfile::tempdir().unwrap();
        let kv = KeyValueStore::new(dir.path());
        let api = ApiStore::new(dir.path().join("api"));
        kv.set_key_value("g-41", "52055-6", Some(ID_MAP_TABLE)).await.unwrap();

        let before = Utc::now() - chrono::Duration::seconds(1);
        let prepared = setup(&context(false), &notion, &ipfs, &kv, &api).await.unwrap();

        assert_eq!(prepared.magazines.len(), 1);
        assert_eq!(prepared.magazines[0].banner, "https://ipfs.example.org/ipfs/bafybanner");
        assert_eq!(prepared.contents.len(), 1);
        assert_eq!(prepared.id_map.get("g-41").map(String::as_str), Some("52055-6"));

        let list: Value = serde_json::from_str(&api.read_magazine_list().await.unwrap().unwrap()).unwrap();
        assert_eq!(list[0]["uid"], "mag-1");
        assert_eq!(list[0]["subTitle"], "Sub");
        assert!(api.orders_path("mag-1").exists());

        let config = config_table(&kv).await;
        let last_update: DateTime<Utc> = config[LAST_UPDATE_KEY].parse().unwrap();
        assert!(last_update >= before);
        let (last_updates, _) = get_map_value(&config, LAST_UPDATES_KEY).unwrap();
        assert_eq!(last_updates.get("mag-1"), Some(&config[LAST_UPDATE_KEY]));
    }

    #[tokio::test]
    async fn test_dry_run_setup_keeps_last_updates() {
        let server = MockServer::start().await;
        mock_sources(&server, &NotionSettings::default()).await;
        let (notion, ipfs) = sources(&server);
        let dir = tempfile::tempdir().unwrap();
        let kv = KeyValueStore::new(dir.path());
        let api = ApiStore::new(dir.path().join("api"));
        kv.set_key_value(LAST_UPDATE_KEY, "2024-01-01T00:00:00.000Z", Some(CONFIG_TABLE))
            .await
            .unwrap();
        let before = config_table(&kv).await;

        let prepared = setup(&context(true), &notion, &ipfs, &kv, &api).await.unwrap();
        assert_eq!(prepared.contents.len(), 1);
        assert!(api.read_magazine_list().await.unwrap().is_some());
        assert_eq!(config_table(&kv).await, before);
    }

    #[tokio::test]
    async fn test_setup_aborts_when_magazine_list_cannot_be_stored() {
        let server = MockServer::start().await;
        mock_sources(&server, &NotionSettings::default()).await;
        let (notion, ipfs) = sources(&server);
        let dir = tempfile::tempdir().unwrap();
        let kv = KeyValueStore::new(dir.path());
        let blocked = dir.path().join("api");
        std::fs::write(&blocked, "not a directory").unwrap();
        let api = ApiStore::new(&blocked);

        let result = setup(&context(false), &notion, &ipfs, &kv, &api).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(config_table(&kv).await.is_empty());
    }
}

//! Nomland share service client.
//!
//! Shares are Crossbell notes that point at an *entity* (the shared page)
//! and carry the sharer's review. This module talks to a Nomland gateway
//! which signs and submits the on-chain writes for the app.
//!
//! # Architecture
//!
//! - [`ShareService`]: the operations the sync pipeline needs
//! - [`NomlandClient`]: HTTP implementation against the gateway
//!
//! # Gateway routes
//!
//! | Operation | Route |
//! |-----------|-------|
//! | [`ShareService::get_share`] | `GET /shares/{characterId}-{noteId}` |
//! | [`ShareService::get_shares`] | `POST /shares/batch` |
//! | [`ShareService::create_share`] | `POST /shares` |
//! | [`ShareService::edit_note`] | `GET` then `PUT /notes/{characterId}-{noteId}` |
//! | [`ShareService::create_entity`] | `POST /entities` |

use crate::entity;
use crate::error::{Error, Result};
use crate::models::{Entity, NoteKey, NoteMetadata, ShareInput, ShareNote};
use crate::utils::truncate_for_log;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use tracing::{debug, info, instrument};

/// A batch of shares as returned by the gateway; republished verbatim.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SharesPage {
    #[serde(default)]
    pub notes: Vec<Value>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

/// `"{characterId}-{noteId}"` of a note in a [`SharesPage`], if it has a key.
pub fn note_key_of(note: &Value) -> Option<String> {
    let key = note.get("key")?;
    let part = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    Some(format!(
        "{}-{}",
        part(key.get("characterId")?)?,
        part(key.get("noteId")?)?
    ))
}

/// The share operations the sync pipeline relies on.
pub trait ShareService {
    /// Fetch a share and its entity; `None` when it does not exist.
    async fn get_share(&self, key: &NoteKey) -> Result<Option<ShareNote>>;

    /// Fetch several shares, in the order of `keys`.
    async fn get_shares(&self, keys: &[NoteKey]) -> Result<SharesPage>;

    /// Publish a new share and return its key.
    async fn create_share(&self, input: &ShareInput) -> Result<NoteKey>;

    /// Load a note's metadata, apply `edit`, and write it back.
    async fn edit_note<F>(&self, key: &NoteKey, edit: F) -> Result<()>
    where
        F: FnOnce(&mut NoteMetadata) + Send;

    /// Register an entity under `character_id` and return its id.
    async fn create_entity(&self, entity: &Entity, character_id: &str) -> Result<String>;

    /// Extract entity metadata from the page at `url`.
    async fn parse_entity(&self, url: &str) -> Result<Entity>;
}

#[derive(Debug, Deserialize)]
struct CreatedShare {
    #[serde(rename = "noteKey")]
    note_key: NoteKey,
}

#[derive(Debug, Deserialize)]
struct CreatedEntity {
    id: Value,
}

/// HTTP client for the Nomland gateway.
#[derive(Clone)]
pub struct NomlandClient {
    client: Client,
    endpoint: String,
    app_name: String,
    admin_key: String,
}

impl fmt::Debug for NomlandClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NomlandClient")
            .field("endpoint", &self.endpoint)
            .field("app_name", &self.app_name)
            .finish()
    }
}

impl NomlandClient {
    pub fn new(client: Client, endpoint: &str, app_name: impl Into<String>, admin_key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            app_name: app_name.into(),
            admin_key: admin_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.admin_key)
            .header("X-App-Name", &self.app_name)
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::Remote {
            service: "nomland",
            status: status.as_u16(),
            body: truncate_for_log(&response.text().await.unwrap_or_default(), 500),
        })
    }
}

impl ShareService for NomlandClient {
    #[instrument(level = "debug", skip(self), fields(%key))]
    async fn get_share(&self, key: &NoteKey) -> Result<Option<ShareNote>> {
        let response = self
            .authed(self.client.get(self.url(&format!("/shares/{key}"))))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = check(response).await?.json::<Option<ShareNote>>().await?;
        Ok(body)
    }

    #[instrument(level = "info", skip_all, fields(count = keys.len()))]
    async fn get_shares(&self, keys: &[NoteKey]) -> Result<SharesPage> {
        let response = self
            .authed(self.client.post(self.url("/shares/batch")))
            .json(&json!({ "keys": keys }))
            .send()
            .await?;
        let page = check(response).await?.json::<SharesPage>().await?;
        debug!(notes = page.notes.len(), "Fetched shares");
        Ok(page)
    }

    #[instrument(level = "info", skip_all, fields(url = %input.details.external_url))]
    async fn create_share(&self, input: &ShareInput) -> Result<NoteKey> {
        let response = self
            .authed(self.client.post(self.url("/shares")))
            .json(input)
            .send()
            .await?;
        let created = check(response).await?.json::<CreatedShare>().await?;
        info!(key = %created.note_key, "Share created");
        Ok(created.note_key)
    }

    #[instrument(level = "info", skip(self, edit), fields(%key))]
    async fn edit_note<F>(&self, key: &NoteKey, edit: F) -> Result<()>
    where
        F: FnOnce(&mut NoteMetadata) + Send,
    {
        let path = format!("/notes/{key}");
        let response = self.authed(self.client.get(self.url(&path))).send().await?;
        let mut metadata = check(response).await?.json::<NoteMetadata>().await?;
        edit(&mut metadata);
        let response = self
            .authed(self.client.put(self.url(&path)))
            .json(&metadata)
            .send()
            .await?;
        check(response).await?;
        info!("Note edited");
        Ok(())
    }

    #[instrument(level = "info", skip(self, entity), fields(url = %entity.url))]
    async fn create_entity(&self, entity: &Entity, character_id: &str) -> Result<String> {
        let response = self
            .authed(self.client.post(self.url("/entities")))
            .json(&json!({ "entity": entity, "characterId": character_id }))
            .send()
            .await?;
        let created = check(response).await?.json::<CreatedEntity>().await?;
        let id = match created.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        info!(%id, "Entity created");
        Ok(id)
    }

    #[instrument(level = "info", skip(self))]
    async fn parse_entity(&self, url: &str) -> Result<Entity> {
        let html = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(entity::parse_entity(&html, url))
    }
}

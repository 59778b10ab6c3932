//! Flat-file persistence.
//!
//! Two kinds of files live on disk:
//!
//! - **Tables** (`{root}/store/{table}.json`): small string-to-string maps
//!   holding sync state, e.g. `nunti-idMap` (Telegram message key to share
//!   id) and `colib-magazine-config` (last-update timestamps).
//! - **API files** (`{api_dir}/...`): the JSON documents the read API serves
//!   verbatim.
//!
//! ```text
//! api_dir/
//! ├── magazinesList
//! └── magazines/
//!     ├── orders-<uid>     # share id -> order
//!     └── content-<uid>    # shares in order, with replies
//! ```
//!
//! Every write reads the whole file, mutates it in memory and writes the
//! whole file back. Nothing is transactional across files.

use crate::error::Result;
use crate::models::Magazine;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument, warn};

/// A string-to-string map as stored on disk.
pub type StringMap = BTreeMap<String, String>;

const DEFAULT_TABLE: &str = "keyValueStore";

/// Parse a stored map; an empty file counts as an empty map.
fn parse_map(data: &str) -> Result<StringMap> {
    if data.trim().is_empty() {
        return Ok(StringMap::new());
    }
    Ok(serde_json::from_str(data)?)
}

async fn read_map(path: &Path) -> Result<Option<StringMap>> {
    match fs::read_to_string(path).await {
        Ok(data) => Ok(Some(parse_map(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?).await?;
    Ok(())
}

/// Decode the JSON-encoded map stored under `key`.
///
/// Returns two independent copies: one to read previous values from, one to
/// record new values into. Both are empty when `key` is absent.
pub fn get_map_value(map: &StringMap, key: &str) -> Result<(StringMap, StringMap)> {
    match map.get(key) {
        Some(data) => {
            let decoded = parse_map(data)?;
            Ok((decoded.clone(), decoded))
        }
        None => Ok((StringMap::new(), StringMap::new())),
    }
}

/// Key/value tables under `{root}/store/`.
#[derive(Debug, Clone)]
pub struct KeyValueStore {
    root: PathBuf,
}

impl KeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `{root}/store/{table}.json`, or `keyValueStore.json` without a table.
    pub fn table_path(&self, table: Option<&str>) -> PathBuf {
        self.root
            .join("store")
            .join(format!("{}.json", table.unwrap_or(DEFAULT_TABLE)))
    }

    /// Set `key` to `value`, creating the table when it does not exist yet.
    #[instrument(level = "debug", skip(self, value))]
    pub async fn set_key_value(&self, key: &str, value: &str, table: Option<&str>) -> Result<()> {
        let path = self.table_path(table);
        let mut store = read_map(&path).await?.unwrap_or_default();
        store.insert(key.to_string(), value.to_string());
        write_json(&path, &store).await
    }

    /// Remove `key`. Returns `false` when the table or the key is missing.
    #[allow(dead_code)]
    #[instrument(level = "debug", skip(self))]
    pub async fn remove_key_value(&self, key: &str, table: Option<&str>) -> Result<bool> {
        let path = self.table_path(table);
        let Some(mut store) = read_map(&path).await? else {
            warn!(path = %path.display(), "No table file found");
            return Ok(false);
        };
        if store.remove(key).is_none() {
            return Ok(false);
        }
        write_json(&path, &store).await?;
        Ok(true)
    }

    /// Copy every pair of the table into `target`. A missing table is logged
    /// and leaves `target` untouched.
    #[instrument(level = "info", skip(self, target))]
    pub async fn load_key_value_pairs(&self, target: &mut StringMap, table: Option<&str>) -> Result<()> {
        let path = self.table_path(table);
        debug!(path = %path.display(), "Loading table");
        match read_map(&path).await? {
            Some(store) => target.extend(store),
            None => warn!(path = %path.display(), "No table file found"),
        }
        Ok(())
    }
}

/// The JSON documents served by the read API.
#[derive(Debug, Clone)]
pub struct ApiStore {
    dir: PathBuf,
}

impl ApiStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn magazine_list_path(&self) -> PathBuf {
        self.dir.join("magazinesList")
    }

    pub fn orders_path(&self, uid: &str) -> PathBuf {
        self.dir.join("magazines").join(format!("orders-{uid}"))
    }

    pub fn content_path(&self, uid: &str) -> PathBuf {
        self.dir.join("magazines").join(format!("content-{uid}"))
    }

    /// Write the magazine list and make sure every magazine has an orders file.
    #[instrument(level = "info", skip_all, fields(count = magazines.len()))]
    pub async fn store_magazine_list(&self, magazines: &[Magazine]) -> Result<()> {
        write_json(&self.magazine_list_path(), magazines).await?;
        for magazine in magazines {
            let path = self.orders_path(&magazine.uid);
            if fs::metadata(&path).await.is_err() {
                write_json(&path, &StringMap::new()).await?;
            }
        }
        Ok(())
    }

    /// Copy the stored orders of magazine `uid` into `target`.
    #[instrument(level = "debug", skip(self, target))]
    pub async fn load_magazine_orders(&self, target: &mut StringMap, uid: &str) -> Result<()> {
        let path = self.orders_path(uid);
        match read_map(&path).await? {
            Some(store) => target.extend(store),
            None => warn!(path = %path.display(), "No orders file found"),
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self, orders))]
    pub async fn store_magazine_orders(&self, uid: &str, orders: &StringMap) -> Result<()> {
        write_json(&self.orders_path(uid), orders).await
    }

    /// Write the already serialized content document of magazine `uid`.
    #[instrument(level = "debug", skip(self, data))]
    pub async fn store_magazine_content(&self, uid: &str, data: &str) -> Result<()> {
        let path = self.content_path(uid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }

    pub async fn read_magazine_list(&self) -> Result<Option<String>> {
        read_optional(&self.magazine_list_path()).await
    }

    pub async fn read_magazine_content(&self, uid: &str) -> Result<Option<String>> {
        read_optional(&self.content_path(uid)).await
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

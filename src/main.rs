//! # colib_magazine
//!
//! Keeps curated magazines in sync with the social graph. Magazine contents
//! are curated in Notion as links to Telegram messages; each one becomes a
//! Nomland share, and every magazine is republished as a small JSON feed.
//!
//! ## Usage
//!
//! ```sh
//! colib_magazine sync            # one synchronization run
//! colib_magazine serve -p 3000   # serve the feed files
//! ```
//!
//! ## Architecture
//!
//! The sync follows a pipeline:
//! 1. **Querying**: Read published magazines and their edited contents from Notion
//! 2. **Scraping**: Read author, text and date from each Telegram message preview
//! 3. **Diffing**: Compare against the published share, if there is one
//! 4. **Publishing**: Create or edit shares, then write order and content files
//!
//! The server only reads the files the sync wrote.

use clap::Parser;
use reqwest::Client;
use std::error::Error;
use std::net::SocketAddr;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod entity;
mod error;
mod ipfs;
mod models;
mod nomland;
mod notion;
mod server;
mod settings;
mod store;
mod sync;
mod telegram;
mod utils;

use cli::{Cli, Command, ServeArgs, SyncArgs};
use ipfs::IpfsUploader;
use nomland::NomlandClient;
use notion::NotionClient;
use settings::Settings;
use store::{ApiStore, KeyValueStore};
use sync::Syncer;
use telegram::TelegramScraper;
use utils::ensure_writable_dir;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let args = Cli::parse();
    debug!(?args.config, ?args.api_dir, "Parsed CLI arguments");

    let settings = Settings::load(args.config.as_deref())?;
    let api = ApiStore::new(&args.api_dir);

    match args.command {
        Command::Sync(sync_args) => run_sync(sync_args, settings, &args.api_dir, api).await,
        Command::Serve(serve_args) => run_serve(serve_args, api).await,
    }
}

#[instrument(level = "info", skip_all)]
async fn run_sync(
    args: SyncArgs,
    settings: Settings,
    api_dir: &std::path::Path,
    api: ApiStore,
) -> Result<(), Box<dyn Error>> {
    let start_time = std::time::Instant::now();

    let context = args.context()?;
    let admin_key = args.admin_key()?;
    info!(
        context_id = %context.context_id,
        context_name = %context.context_name,
        context_group_id = %context.context_group_id,
        dry_run = context.dry_run,
        "Env initialized"
    );

    // Early check: both output locations must be writable
    for dir in [api_dir.join("magazines"), args.store_root.join("store")] {
        if let Err(e) = ensure_writable_dir(&dir).await {
            error!(path = %dir.display(), error = %e, "Directory is not writable");
            return Err(e);
        }
    }

    let client = Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let notion = NotionClient::new(client.clone(), &args.notion_api_key, settings.notion.clone());
    let ipfs = IpfsUploader::new(client.clone(), &settings.ipfs_endpoint);
    let nomland = NomlandClient::new(client.clone(), &settings.nomland_endpoint, &args.app_name, admin_key);
    let telegram = TelegramScraper::new(client, &settings.bot_name);
    let kv = KeyValueStore::new(&args.store_root);
    info!(?nomland, "Nomland initialized");

    let prepared = sync::setup(&context, &notion, &ipfs, &kv, &api).await?;

    let mut syncer = Syncer::new(
        nomland,
        telegram,
        kv,
        api,
        settings.notion.properties.clone(),
        context,
        prepared.id_map,
    );
    let report = syncer
        .sync_contents(&prepared.contents, &prepared.magazines)
        .await;
    syncer
        .publish_feeds(&prepared.contents, &prepared.magazines)
        .await?;

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        created = report.created,
        updated = report.updated,
        failed = report.failed,
        shares = syncer.id_map().len(),
        "Sync complete"
    );
    Ok(())
}

async fn run_serve(args: ServeArgs, api: ApiStore) -> Result<(), Box<dyn Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    server::serve(api, addr).await?;
    Ok(())
}

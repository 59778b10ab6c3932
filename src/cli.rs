//! Command-line interface definitions for colib_magazine.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Every option can also come from the environment, which is how the sync is
//! usually configured when run from a scheduled job.

use crate::error::{Error, Result};
use crate::sync::SyncContext;
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the colib_magazine application.
///
/// # Examples
///
/// ```sh
/// # One synchronization run, logging remote writes instead of doing them
/// DRY_RUN=true colib_magazine sync
///
/// # Serve the generated feed on port 8080
/// colib_magazine serve --port 8080
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to a YAML settings file
    #[arg(short, long, env = "CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory the read API files are written to and served from
    #[arg(long, env = "API_DIR", default_value = "./api", global = true)]
    pub api_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Synchronize magazine contents from Notion to Nomland, then rebuild the feed files
    Sync(SyncArgs),
    /// Serve the feed files over HTTP
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Character id of the publishing context
    #[arg(long, env = "CONTEXT_ID")]
    pub context_id: Option<String>,

    /// Display name of the publishing context
    #[arg(long, env = "CONTEXT_NAME")]
    pub context_name: Option<String>,

    /// Prefix of Telegram message keys
    #[arg(long, env = "CONTEXT_GROUP_ID")]
    pub context_group_id: Option<String>,

    /// Admin key of the Nomland app
    #[arg(long, env = "APP_ADMIN_KEY", hide_env_values = true)]
    pub app_admin_key: Option<String>,

    /// Name of the Nomland app
    #[arg(long, env = "APP_NAME", default_value = "")]
    pub app_name: String,

    /// Notion integration token
    #[arg(long, env = "NOTION_API_KEY", hide_env_values = true, default_value = "")]
    pub notion_api_key: String,

    /// Root directory of the `store/` tables
    #[arg(long, env = "NOTE_ID_MAP_PATH", default_value = "./")]
    pub store_root: PathBuf,

    /// Log remote writes instead of performing them.
    /// `0`, `false`, `no`, `off` or an empty value leave it off; any other value turns it on
    #[arg(
        long,
        env = "DRY_RUN",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value = "false",
        default_missing_value = "true",
        value_parser = FalseyValueParser::new()
    )]
    pub dry_run: bool,
}

impl SyncArgs {
    /// The publishing context, failing when any part of it is missing.
    pub fn context(&self) -> Result<SyncContext> {
        let present = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        match (
            present(&self.context_id),
            present(&self.context_name),
            present(&self.context_group_id),
        ) {
            (Some(context_id), Some(context_name), Some(context_group_id)) => Ok(SyncContext {
                context_id,
                context_name,
                context_group_id,
                dry_run: self.dry_run,
            }),
            _ => Err(Error::Config(
                "Context id, context name or context group id not found in env.".to_string(),
            )),
        }
    }

    /// The Nomland admin key, failing when it is missing.
    pub fn admin_key(&self) -> Result<&str> {
        self.app_admin_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("APP_ADMIN_KEY not found in env.".to_string()))
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,
}

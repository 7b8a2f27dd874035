//! image-spider: a resumable image-crawling pipeline.
//!
//! Per configured source, a crawl engine discovers post ids from paginated
//! listings, ingests per-post metadata into a partitioned relational store,
//! a download pool fetches and converts the binaries with resume support,
//! an integrity checker re-verifies the artifacts on disk, and a read-only
//! HTTP surface exposes the catalogue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;

pub mod application;
pub mod components;
pub mod domain;
pub mod infrastructure;

use application::Application;
use components::api::Api;
use components::checker::DataChecker;
use components::convert::ImageConvert;
use components::database::Database;
use components::downloader::ImageDownloader;
use components::spider::Spider;
use infrastructure::config::AppConfig;
use infrastructure::cursor::CursorStore;

#[derive(Debug, Parser)]
#[command(name = "image-spider", about = "Resumable image-crawling pipeline")]
struct Cli {
    /// Path to the main YAML config; CONFIG_PATH works too.
    #[arg(short = 'c', long = "config", env = "CONFIG_PATH")]
    config: Option<PathBuf>,
}

/// Make every component known to the registry. Which ones actually load is
/// decided by the config's `plugins` list (plus lazy dependency loading).
fn register_components(app: &Arc<Application>) {
    app.register(Database::new());
    app.register(ImageConvert::new());
    app.register(ImageDownloader::new());
    app.register(DataChecker::new());
    app.register(Spider::new());
    app.register(Api::new());
}

/// Parse the CLI, load config and logging, then run the application until a
/// termination signal unloads everything.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let Some(config_path) = cli.config else {
        bail!("config file path is empty: pass -c <path> or set CONFIG_PATH");
    };
    let config = AppConfig::load(&config_path)?;
    infrastructure::logging::init(&config.logger)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let cursor = CursorStore::load(config.work_dir.join("runtimeConfig.yaml"));
        let app = Application::new(config, cursor);
        register_components(&app);
        app.run().await
    })
}

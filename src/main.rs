//! Blogd - a personal blog server with live reload and issue tracker sync.

mod cache;
mod cli;
mod config;
mod docs;
mod engine;
mod logger;
mod reload;
mod serve;
mod sync;
mod utils;

use anyhow::{Result, bail};
use cache::FileCache;
use clap::Parser;
use cli::{Cli, Commands};
use config::SiteConfig;
use docs::DocIndex;
use engine::Engine;
use reload::Notifier;
use serve::{App, serve_site};
use std::sync::Arc;
use sync::Syncer;

fn main() -> Result<()> {
    let cli: &'static Cli = Box::leak(Box::new(Cli::parse()));
    let config: &'static SiteConfig = Box::leak(Box::new(load_config(cli)?));

    match &cli.command {
        Commands::Serve { .. } => run_serve(config),
        Commands::Sync { pull } => run_sync(config, *pull),
    }
}

/// Load and validate configuration from CLI arguments
fn load_config(cli: &'static Cli) -> Result<SiteConfig> {
    let root = cli.root.as_deref().unwrap_or(std::path::Path::new("./"));
    let config_path = root.join(&cli.config);

    if !config_path.exists() {
        bail!("Config file not found at {}.", config_path.display());
    }

    let mut config = SiteConfig::from_path(&config_path)?;
    config.update_with_cli(cli);
    // Sync runs headless; only the server needs the full site tree present.
    if cli.is_serve() {
        config.validate()?;
    }
    Ok(config)
}

fn run_serve(config: &'static SiteConfig) -> Result<()> {
    let cache = FileCache::load(Some(config.cache_path().to_path_buf()));
    let engine = Arc::new(Engine::new(config, cache.clone()));
    let docs = Arc::new(DocIndex::new(config, cache.clone()));
    let notifier = Arc::new(Notifier::new());

    // Feed every finished render into the live-reload manifest.
    let notifier_for_hook = Arc::clone(&notifier);
    engine.set_render_hook(Box::new(move |notice| notifier_for_hook.record(notice)));

    // Sidecars may be stale after offline edits.
    if config.is_local() {
        docs.sync_meta(None)?;
    }

    let syncer = if config.tracker.is_configured() {
        Some(Arc::new(Syncer::new(config)?))
    } else {
        None
    };

    serve_site(App {
        config,
        cache,
        engine,
        docs,
        notifier,
        syncer,
    })
}

fn run_sync(config: &'static SiteConfig, pull: bool) -> Result<()> {
    if !config.tracker.is_configured() {
        bail!("No tracker account configured; set [tracker] name and repo.");
    }

    let syncer = Syncer::new(config)?;
    if pull { syncer.pull() } else { syncer.push() }
}

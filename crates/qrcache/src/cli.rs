//! Exposes the command line application.
use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qrcache_service::caching;
use qrcache_service::config::Config;
use qrcache_service::images::ImageCache;
use qrcache_service::metrics;
use url::Url;

use crate::logging;

/// qrcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load images through the cache and print their dimensions.
    Fetch {
        /// The URLs of the images to load.
        #[arg(required = true, value_name = "URL")]
        urls: Vec<Url>,
    },

    /// Clean the local image cache.
    Cleanup {
        /// Only report what would be removed, without deleting anything.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "qrcache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned yet.
    unsafe { logging::init_logging(&config) };

    if let Some(statsd) = &config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        if let Err(err) = metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "Failed to set up statsd, metrics are disabled"
            );
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("qrcache-worker")
        .enable_all()
        .build()?;

    match cli.command {
        Command::Fetch { urls } => runtime.block_on(fetch(&config, urls)),
        Command::Cleanup { dry_run } => runtime
            .block_on(cleanup(&config, dry_run))
            .context("failed to clean up caches"),
    }
}

async fn fetch(config: &Config, urls: Vec<Url>) -> Result<()> {
    let cache = ImageCache::from_config(config).context("failed to set up image cache")?;
    let cache = &cache;

    let requests = urls
        .iter()
        .map(|url| async move { (url, cache.image(url).await) });
    let results = futures::future::join_all(requests).await;

    let mut failed = 0;
    for (url, image) in results {
        match image {
            Some(image) => println!(
                "{url}: {}x{} ({} bytes)",
                image.width(),
                image.height(),
                image.data().len()
            ),
            None => {
                failed += 1;
                println!("{url}: failed");
            }
        }
    }

    let fetcher = cache.fetcher().stats();
    println!(
        "downloads: {} completed, {} failed, at most {} in flight",
        fetcher.completed(),
        fetcher.failed(),
        fetcher.max_in_flight()
    );
    if let Some(disk) = cache.disk() {
        // wait for scheduled writes before the process exits
        disk.sync().await;
        let stats = disk.stats();
        println!(
            "disk cache: {} reads, {} hits, {} writes, {} expired, {} evicted",
            stats.reads(),
            stats.hits(),
            stats.writes(),
            stats.expired(),
            stats.evicted()
        );
    }

    if failed > 0 {
        anyhow::bail!("failed to load {failed} of {} images", urls.len());
    }
    Ok(())
}

async fn cleanup(config: &Config, dry_run: bool) -> Result<()> {
    let stats = caching::cleanup(config, dry_run).await?;

    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!(
        "{verb} {} files, totaling {} bytes",
        stats.removed_files, stats.removed_bytes
    );
    println!(
        "Retained {} files, totaling {} bytes",
        stats.retained_files, stats.retained_bytes
    );
    Ok(())
}

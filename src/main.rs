//! dmarc-ingest - DMARC Report Ingestion Pipeline
//!
//! This tool watches a report mailbox for DMARC aggregate and forensic
//! reports, normalizes them into a canonical record model with network
//! identity enrichment, and emits the outcome stream as JSON for downstream
//! sinks. Report files can also be parsed directly without a mailbox.

mod aggregate;
mod batch;
mod config;
mod enrich;
mod error;
mod extract;
mod forensic;
mod geo;
mod models;
mod psl;
mod watcher;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use enrich::EnrichmentCache;
use extract::Payload;
use geo::GeoSnapshot;
use models::{ParseFailure, ParseOutcome};
use psl::PslSnapshot;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use watcher::MailboxWatcher;

/// CLI arguments for dmarc-ingest.
#[derive(Parser, Debug)]
#[command(
    version,
    about = "DMARC report mailbox ingestion and normalization pipeline",
    long_about = "dmarc-ingest connects to a report mailbox, extracts aggregate and \
                  forensic DMARC reports from heterogeneous real-world payloads \
                  (gzip/zip-wrapped XML, legacy message containers, raw MIME), \
                  normalizes them, and prints the outcome stream as JSON.\n\n\
                  With FILE arguments it parses report files directly and no \
                  mailbox is needed."
)]
struct Cli {
    /// Report files to parse directly (zip, gz, xml, or raw message)
    #[arg(value_parser)]
    files: Vec<PathBuf>,

    /// Keep watching the mailbox instead of a single pass
    #[arg(short, long)]
    watch: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_snapshots(config: &Config) -> Result<(Arc<GeoSnapshot>, Arc<PslSnapshot>)> {
    let geo = match &config.geo_db_path {
        Some(path) => {
            let snapshot = GeoSnapshot::load(path)
                .with_context(|| format!("Failed to load geolocation database {}", path))?;
            log::info!("Loaded {} geolocation prefixes from {}", snapshot.len(), path);
            snapshot
        }
        None => GeoSnapshot::empty(),
    };
    let psl = match &config.psl_path {
        Some(path) => {
            let snapshot = PslSnapshot::load(path)
                .with_context(|| format!("Failed to load public suffix snapshot {}", path))?;
            log::info!("Loaded {} public suffix rules from {}", snapshot.len(), path);
            snapshot
        }
        None => PslSnapshot::builtin(),
    };
    Ok((Arc::new(geo), Arc::new(psl)))
}

fn parse_files(
    files: &[PathBuf],
    config: &Config,
    geo: Arc<GeoSnapshot>,
    psl: Arc<PslSnapshot>,
) -> Vec<ParseOutcome> {
    let mut cache = EnrichmentCache::from_config(config, geo, psl);
    let mut outcomes = Vec::new();
    for file in files {
        log::info!("Processing file: {}", file.display());
        let payloads = match extract::extract_from_file(file, config) {
            Ok(payloads) => payloads,
            Err(e) => {
                outcomes.push(ParseOutcome::Failure(ParseFailure {
                    message_id: file.display().to_string(),
                    reason: e.to_string(),
                }));
                continue;
            }
        };
        if payloads.is_empty() {
            log::warn!("No report payloads recognized in {}", file.display());
        }
        for payload in payloads {
            let parsed = match payload {
                Payload::Xml(xml) => {
                    aggregate::parse_aggregate_xml(&xml, &mut cache).map(ParseOutcome::Aggregate)
                }
                Payload::Forensic(bytes) => {
                    forensic::parse_forensic_email(&bytes, &mut cache).map(ParseOutcome::Forensic)
                }
            };
            outcomes.push(parsed.unwrap_or_else(|e| {
                ParseOutcome::Failure(ParseFailure {
                    message_id: file.display().to_string(),
                    reason: e.to_string(),
                })
            }));
        }
    }
    outcomes
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity.
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(if cli.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let config = Config::new().context("Failed to load configuration")?;
    let (geo, psl) = load_snapshots(&config)?;

    if !cli.files.is_empty() {
        let outcomes = parse_files(&cli.files, &config, geo, psl);
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
        return Ok(());
    }

    let watcher = MailboxWatcher::new(config, geo, psl).context("Mailbox not configured")?;
    let cancel = watcher.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutdown requested; finishing in-flight work");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    if cli.watch {
        log::info!("Watching mailbox (continuous mode)");
        tokio::task::spawn_blocking(move || {
            watcher.watch(|outcomes| match serde_json::to_string_pretty(outcomes) {
                Ok(json) => println!("{}", json),
                Err(e) => log::error!("Failed to serialize batch: {}", e),
            })
        })
        .await?
        .context("Watch loop failed")?;
    } else {
        let outcomes = tokio::task::spawn_blocking(move || watcher.run_once())
            .await?
            .context("Mailbox pass failed")?;
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    }

    log::info!("Ingestion complete");
    Ok(())
}

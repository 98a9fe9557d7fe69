//! dmarc-ingest Library
//!
//! This library provides the core functionality of the ingestion pipeline:
//! configuration, error handling, the canonical record model, payload
//! extraction, aggregate and forensic report parsing, enrichment caching,
//! the mailbox watcher, and the batch dispatcher.

pub mod aggregate;
pub mod batch;
pub mod config;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod forensic;
pub mod geo;
pub mod models;
pub mod psl;
pub mod watcher;

pub use aggregate::parse_aggregate_xml;
pub use batch::RawMessage;
pub use config::Config;
pub use enrich::EnrichmentCache;
pub use error::{IngestError, Result};
pub use forensic::parse_forensic_email;
pub use geo::GeoSnapshot;
pub use models::{AggregateReport, ForensicReport, MessageOutcome, ParseFailure, ParseOutcome};
pub use psl::PslSnapshot;
pub use watcher::MailboxWatcher;

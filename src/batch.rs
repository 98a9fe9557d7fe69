//! Batch Dispatcher Module
//!
//! This module drives a backlog of raw messages through the extractor and
//! parsers. With one worker it runs sequentially; with N workers it
//! partitions the backlog across a dedicated rayon pool, each worker owning
//! its own enrichment cache, and reassembles the outcomes in original
//! discovery order. One poisoned message never affects the rest of the
//! batch: parse errors become `ParseFailure` outcomes and a panicking parser
//! is confined to its message slot.

use crate::config::Config;
use crate::enrich::EnrichmentCache;
use crate::extract::{self, Payload};
use crate::geo::GeoSnapshot;
use crate::models::{MessageOutcome, ParseFailure, ParseOutcome};
use crate::psl::PslSnapshot;
use crate::{aggregate, forensic};
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// One discovered mailbox message, in discovery order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub uid: u32,
    pub bytes: Vec<u8>,
}

/// Routes one message through extractor and parsers. Parsing is a pure
/// function of the message bytes plus the worker's private cache.
pub fn process_message(
    message: &RawMessage,
    config: &Config,
    cache: &mut EnrichmentCache,
) -> MessageOutcome {
    let message_id = extract::message_id(&message.bytes);
    let payloads = match extract::extract_payloads(&message.bytes, config) {
        Ok(payloads) => payloads,
        Err(e) => {
            return MessageOutcome {
                uid: message.uid,
                message_id: message_id.clone(),
                outcomes: vec![ParseOutcome::Failure(ParseFailure {
                    message_id,
                    reason: e.to_string(),
                })],
            };
        }
    };

    let mut outcomes = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let parsed = match payload {
            Payload::Xml(xml) => {
                aggregate::parse_aggregate_xml(&xml, cache).map(ParseOutcome::Aggregate)
            }
            Payload::Forensic(bytes) => {
                forensic::parse_forensic_email(&bytes, cache).map(ParseOutcome::Forensic)
            }
        };
        outcomes.push(parsed.unwrap_or_else(|e| {
            log::warn!("Payload in message {} failed to parse: {}", message.uid, e);
            ParseOutcome::Failure(ParseFailure {
                message_id: message_id.clone(),
                reason: e.to_string(),
            })
        }));
    }

    MessageOutcome { uid: message.uid, message_id, outcomes }
}

fn process_guarded(
    message: &RawMessage,
    config: &Config,
    cache: &mut EnrichmentCache,
) -> MessageOutcome {
    catch_unwind(AssertUnwindSafe(|| process_message(message, config, cache))).unwrap_or_else(
        |_| {
            let message_id = extract::message_id(&message.bytes);
            log::error!("Parser panicked on message {}", message.uid);
            MessageOutcome {
                uid: message.uid,
                message_id: message_id.clone(),
                outcomes: vec![ParseOutcome::Failure(ParseFailure {
                    message_id,
                    reason: "parser panicked".to_string(),
                })],
            }
        },
    )
}

/// Parses a batch, preserving discovery order in the result sequence.
pub fn run(
    messages: &[RawMessage],
    config: &Config,
    geo: &Arc<GeoSnapshot>,
    psl: &Arc<PslSnapshot>,
) -> Vec<MessageOutcome> {
    let workers = config.workers.max(1);
    if workers == 1 || messages.len() <= 1 {
        return run_sequential(messages, config, geo, psl);
    }

    let pool = match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool,
        Err(e) => {
            log::warn!("Worker pool unavailable ({}); parsing sequentially", e);
            return run_sequential(messages, config, geo, psl);
        }
    };

    let chunk_size = messages.len().div_ceil(workers);
    log::debug!(
        "Dispatching {} messages across {} workers (chunk size {})",
        messages.len(),
        workers,
        chunk_size
    );
    let partitions: Vec<Vec<MessageOutcome>> = pool.install(|| {
        messages
            .par_chunks(chunk_size)
            .map(|partition| {
                // Caches are per worker, not shared: a few redundant lookups
                // in exchange for isolation.
                let mut cache = EnrichmentCache::from_config(config, geo.clone(), psl.clone());
                partition
                    .iter()
                    .map(|message| process_guarded(message, config, &mut cache))
                    .collect()
            })
            .collect()
    });
    partitions.into_iter().flatten().collect()
}

fn run_sequential(
    messages: &[RawMessage],
    config: &Config,
    geo: &Arc<GeoSnapshot>,
    psl: &Arc<PslSnapshot>,
) -> Vec<MessageOutcome> {
    let mut cache = EnrichmentCache::from_config(config, geo.clone(), psl.clone());
    messages
        .iter()
        .map(|message| process_guarded(message, config, &mut cache))
        .collect()
}

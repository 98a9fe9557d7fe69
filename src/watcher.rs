//! Mailbox Watcher Module
//!
//! This module owns the persistent connection to the report mailbox. It
//! discovers report-bearing messages in stable order, drives them through the
//! extractor and parsers via the batch dispatcher, and only then reconciles
//! the mailbox: processed messages are moved or deleted one at a time,
//! failed messages go to a quarantine folder, and no message is touched
//! until every message in the batch has reached a terminal parse outcome.
//! Any transport error forces a full reconnect-and-reselect cycle; in
//! continuous mode the watcher loops indefinitely.

use crate::batch::{self, RawMessage};
use crate::config::{Config, ProcessedAction, ZeroPayloadPolicy};
use crate::error::{IngestError, Result};
use crate::geo::GeoSnapshot;
use crate::models::MessageOutcome;
use crate::psl::PslSnapshot;
use imap::extensions::idle::WaitOutcome;
use imap::types::UnsolicitedResponse;
use imap::{ClientBuilder, ConnectionMode, TlsKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Session = imap::Session<imap::Connection>;

/// Per-message mailbox action, computed only after the whole batch parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Move to the archive folder.
    Archive(u32),
    /// Delete outright.
    Delete(u32),
    /// Move to the quarantine folder for inspection.
    Quarantine(u32),
    /// Leave untouched.
    Leave(u32),
}

/// Bounded exponential backoff between reconnect attempts, capped at one
/// minute.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt.saturating_sub(1).min(6)).min(60))
}

/// Re-addresses a `/`-separated folder path with the server's hierarchy
/// delimiter.
pub fn substitute_separator(folder: &str, delimiter: &str) -> String {
    if delimiter == "/" {
        folder.to_string()
    } else {
        folder.replace('/', delimiter)
    }
}

/// Computes the mailbox action for every message in a fully-parsed batch.
/// Pure so the reconciliation policy is testable without a server.
pub fn plan_reconciliation(outcomes: &[MessageOutcome], config: &Config) -> Vec<ReconcileAction> {
    outcomes
        .iter()
        .map(|outcome| {
            if outcome.failed() {
                // Never delete what we could not parse.
                match config.processed_action {
                    ProcessedAction::Leave => ReconcileAction::Leave(outcome.uid),
                    _ => ReconcileAction::Quarantine(outcome.uid),
                }
            } else if outcome.empty() {
                match (config.zero_payload, config.processed_action) {
                    (_, ProcessedAction::Leave) => ReconcileAction::Leave(outcome.uid),
                    (ZeroPayloadPolicy::Review, _) => ReconcileAction::Quarantine(outcome.uid),
                    // Archived as processed so it is never fetched again.
                    (ZeroPayloadPolicy::Archive, _) => ReconcileAction::Archive(outcome.uid),
                }
            } else {
                match config.processed_action {
                    ProcessedAction::Move => ReconcileAction::Archive(outcome.uid),
                    ProcessedAction::Delete => ReconcileAction::Delete(outcome.uid),
                    ProcessedAction::Leave => ReconcileAction::Leave(outcome.uid),
                }
            }
        })
        .collect()
}

pub struct MailboxWatcher {
    config: Arc<Config>,
    geo: Arc<GeoSnapshot>,
    psl: Arc<PslSnapshot>,
    cancel: Arc<AtomicBool>,
}

impl MailboxWatcher {
    /// Builds a watcher; missing mailbox endpoint or credentials are a fatal
    /// startup error, the only kind the pipeline has.
    pub fn new(config: Config, geo: Arc<GeoSnapshot>, psl: Arc<PslSnapshot>) -> Result<Self> {
        if config.imap_host.is_none()
            || config.imap_user.is_none()
            || config.imap_password.is_none()
        {
            return Err(IngestError::Config(
                "mailbox host, user, and password must be configured".to_string(),
            ));
        }
        Ok(MailboxWatcher { config: Arc::new(config), geo, psl, cancel: Arc::new(AtomicBool::new(false)) })
    }

    /// Flag shared with the caller; setting it cancels the run at the next
    /// phase boundary. Cancellation before reconciliation leaves the mailbox
    /// untouched; once reconciliation started, in-flight actions complete.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// One full discover -> process -> reconcile cycle, returning the
    /// accumulated outcome set.
    pub fn run_once(&self) -> Result<Vec<MessageOutcome>> {
        let mut session = self.connect()?;
        let result = self.cycle(&mut session);
        let _ = session.logout();
        result
    }

    /// Continuous mode: cycle, then block in IDLE until the server pushes a
    /// notification or the bounded refresh interval elapses. Transport errors
    /// at any state drop the session and reconnect from scratch.
    pub fn watch<F>(&self, mut on_batch: F) -> Result<()>
    where
        F: FnMut(&[MessageOutcome]),
    {
        let mut attempt: u32 = 0;
        loop {
            if self.cancelled() {
                return Ok(());
            }
            let mut session = match self.try_connect() {
                Ok(session) => {
                    attempt = 0;
                    session
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    log::warn!("Connect attempt {} failed: {}", attempt, e);
                    std::thread::sleep(backoff_delay(attempt));
                    continue;
                }
            };
            match self.session_loop(&mut session, &mut on_batch) {
                Ok(()) => {
                    let _ = session.logout();
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Session dropped ({}); reconnecting", e);
                }
            }
        }
    }

    fn session_loop<F>(&self, session: &mut Session, on_batch: &mut F) -> Result<()>
    where
        F: FnMut(&[MessageOutcome]),
    {
        loop {
            if self.cancelled() {
                return Ok(());
            }
            let outcomes = self.cycle(session)?;
            if !outcomes.is_empty() {
                on_batch(&outcomes);
            }
            if self.cancelled() {
                return Ok(());
            }
            self.idle_wait(session)?;
        }
    }

    /// Fetch, parse, and (unless cancelled) reconcile one batch. The session
    /// must already be selected when called from the watch loop; `run_once`
    /// selects here.
    fn cycle(&self, session: &mut Session) -> Result<Vec<MessageOutcome>> {
        let delimiter = self.probe_delimiter(session);
        self.select_folder(session, &self.config.folder)?;

        let batch = self.fetch_batch(session)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        log::info!("Processing batch of {} messages", batch.len());

        let outcomes = batch::run(&batch, &self.config, &self.geo, &self.psl);

        if self.cancelled() {
            log::info!("Cancelled before reconciliation; mailbox left untouched");
            return Ok(outcomes);
        }

        let plan = plan_reconciliation(&outcomes, &self.config);
        self.reconcile(session, &plan, delimiter.as_deref().unwrap_or("/"));
        Ok(outcomes)
    }

    fn try_connect(&self) -> Result<Session> {
        // Presence validated in new().
        let host = self.config.imap_host.clone().unwrap_or_default();
        let user = self.config.imap_user.clone().unwrap_or_default();
        let password = self.config.imap_password.clone().unwrap_or_default();
        log::debug!("Connecting to {}:{}", host, self.config.imap_port);
        let client = ClientBuilder::new(host.as_str(), self.config.imap_port)
            .tls_kind(TlsKind::Native)
            .mode(ConnectionMode::AutoTls)
            .danger_skip_tls_verify(self.config.skip_tls_verify)
            .connect()?;
        let session = client.login(&user, &password).map_err(|e| IngestError::from(e.0))?;
        log::debug!("Authenticated as {}", user);
        Ok(session)
    }

    /// Connects with bounded retries; a session is never left half-open —
    /// each attempt either yields an authenticated session or nothing.
    fn connect(&self) -> Result<Session> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                std::thread::sleep(backoff_delay(attempt - 1));
            }
            match self.try_connect() {
                Ok(session) => return Ok(session),
                Err(e) => {
                    log::warn!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| IngestError::Transport("connection failed".to_string())))
    }

    fn probe_delimiter(&self, session: &mut Session) -> Option<String> {
        match session.list(Some(""), Some("")) {
            Ok(names) => names
                .iter()
                .next()
                .and_then(|name| name.delimiter())
                .map(|d| d.to_string()),
            Err(e) => {
                log::debug!("Hierarchy delimiter probe failed: {}", e);
                None
            }
        }
    }

    /// Selects a folder, substituting the server's hierarchy delimiter when
    /// the primary separator is rejected.
    fn select_folder(&self, session: &mut Session, folder: &str) -> Result<String> {
        match session.select(folder) {
            Ok(_) => Ok(folder.to_string()),
            Err(primary) => {
                let delimiter = self.probe_delimiter(session).unwrap_or_else(|| ".".to_string());
                let fallback = substitute_separator(folder, &delimiter);
                if fallback != folder {
                    log::info!("Folder {:?} rejected; retrying as {:?}", folder, fallback);
                    session.select(&fallback)?;
                    Ok(fallback)
                } else {
                    Err(primary.into())
                }
            }
        }
    }

    fn search_term(&self) -> &'static str {
        // When processed mail stays in place, only unseen mail is new work;
        // otherwise the folder drains on reconciliation.
        match self.config.processed_action {
            ProcessedAction::Leave => "UNSEEN",
            _ => "ALL",
        }
    }

    /// Enumerates matching messages and fetches their raw bytes in chunks,
    /// preserving ascending-UID discovery order for this fetch cycle.
    fn fetch_batch(&self, session: &mut Session) -> Result<Vec<RawMessage>> {
        let uids = session.uid_search(self.search_term())?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut bodies: HashMap<u32, Vec<u8>> = HashMap::new();
        let chunk_size = self.config.fetch_chunk_size.max(1);
        for chunk in uids.chunks(chunk_size) {
            let uid_set = chunk.iter().map(|uid| uid.to_string()).collect::<Vec<_>>().join(",");
            let fetches = session.uid_fetch(uid_set, "(UID RFC822)")?;
            for fetch in fetches.iter() {
                if let (Some(uid), Some(body)) = (fetch.uid, fetch.body()) {
                    bodies.insert(uid, body.to_vec());
                }
            }
        }

        Ok(uids
            .into_iter()
            .filter_map(|uid| bodies.remove(&uid).map(|bytes| RawMessage { uid, bytes }))
            .collect())
    }

    /// Executes the reconciliation plan one message at a time. Individual
    /// move/delete errors are logged and skipped; the remainder of the plan
    /// still runs.
    fn reconcile(&self, session: &mut Session, plan: &[ReconcileAction], delimiter: &str) {
        let archive = substitute_separator(&self.config.archive_folder, delimiter);
        let quarantine = substitute_separator(&self.config.quarantine_folder, delimiter);

        if plan.iter().any(|a| matches!(a, ReconcileAction::Archive(_))) {
            self.ensure_folder(session, &archive);
        }
        if plan.iter().any(|a| matches!(a, ReconcileAction::Quarantine(_))) {
            self.ensure_folder(session, &quarantine);
        }

        let mut expunge_needed = false;
        for action in plan {
            let (uid, result) = match action {
                ReconcileAction::Archive(uid) => (*uid, move_message(session, *uid, &archive)),
                ReconcileAction::Quarantine(uid) => {
                    log::warn!("Quarantining message UID {} to {:?}", uid, quarantine);
                    (*uid, move_message(session, *uid, &quarantine))
                }
                ReconcileAction::Delete(uid) => (*uid, delete_message(session, *uid)),
                ReconcileAction::Leave(uid) => (*uid, Ok(false)),
            };
            match result {
                Ok(moved) => expunge_needed |= moved,
                Err(e) => {
                    let e = IngestError::Reconciliation(format!("UID {}: {}", uid, e));
                    log::warn!("{}", e);
                }
            }
        }
        if expunge_needed {
            if let Err(e) = session.expunge() {
                log::warn!("Expunge after reconciliation failed: {}", e);
            }
        }
    }

    fn ensure_folder(&self, session: &mut Session, folder: &str) {
        // Create is idempotent for our purposes; an already-exists response
        // is indistinguishable from success here.
        if let Err(e) = session.create(folder) {
            log::debug!("Create {:?}: {}", folder, e);
        }
    }

    /// Blocks awaiting a server push, re-issued at the bounded refresh
    /// interval so the server never expires the session unrefreshed.
    fn idle_wait(&self, session: &mut Session) -> Result<()> {
        log::debug!("Entering IDLE (refresh every {}s)", self.config.idle_refresh_secs);
        let mut handle = session.idle();
        handle.timeout(Duration::from_secs(self.config.idle_refresh_secs));
        match handle.wait_while(|response| {
            !matches!(
                response,
                UnsolicitedResponse::Exists(_) | UnsolicitedResponse::Recent(_)
            )
        }) {
            Ok(WaitOutcome::MailboxChanged) => {
                log::debug!("IDLE woke on mailbox change");
                Ok(())
            }
            Ok(WaitOutcome::TimedOut) => {
                log::debug!("IDLE refresh interval elapsed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn move_message(session: &mut Session, uid: u32, target: &str) -> Result<bool> {
    session.uid_copy(uid.to_string(), target)?;
    session.uid_store(uid.to_string(), "+FLAGS.SILENT (\\Deleted)")?;
    Ok(true)
}

fn delete_message(session: &mut Session, uid: u32) -> Result<bool> {
    session.uid_store(uid.to_string(), "+FLAGS.SILENT (\\Deleted)")?;
    Ok(true)
}

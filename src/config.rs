//! Configuration Module
//!
//! This module reads configuration values from environment variables,
//! provides sensible defaults, and validates key parameters at startup.
//! Unrecoverable configuration problems (missing mailbox credentials,
//! oversized limits) are the only fatal conditions in the pipeline;
//! everything past startup degrades per message instead of aborting.

use anyhow::Result;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;

/// What to do with a message once every payload in it parsed successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedAction {
    /// Move to the archive folder (default).
    Move,
    /// Delete from the mailbox.
    Delete,
    /// Leave in place; discovery switches to UNSEEN so mail is not reprocessed.
    Leave,
}

impl FromStr for ProcessedAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "move" => Ok(ProcessedAction::Move),
            "delete" => Ok(ProcessedAction::Delete),
            "leave" => Ok(ProcessedAction::Leave),
            _ => Err(format!("Invalid processed action: {}", s)),
        }
    }
}

/// What to do with a message that carried zero recognized report payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroPayloadPolicy {
    /// Archive as processed so it is never fetched again (default).
    Archive,
    /// Move to the quarantine folder for human review.
    Review,
}

impl FromStr for ZeroPayloadPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "archive" => Ok(ZeroPayloadPolicy::Archive),
            "review" => Ok(ZeroPayloadPolicy::Review),
            _ => Err(format!("Invalid zero-payload policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Mailbox endpoint. Host/user/password stay optional so report files can
    // be parsed locally without a mailbox; the watcher validates them.
    pub imap_host: Option<String>,
    pub imap_port: u16,
    pub imap_user: Option<String>,
    pub imap_password: Option<String>,
    pub skip_tls_verify: bool,

    pub folder: String,
    pub archive_folder: String,
    pub quarantine_folder: String,
    pub processed_action: ProcessedAction,
    pub zero_payload: ZeroPayloadPolicy,

    pub idle_refresh_secs: u64,
    pub fetch_chunk_size: usize,
    pub connect_attempts: u32,

    pub workers: usize,

    pub offline: bool,
    pub nameservers: Vec<IpAddr>,
    pub dns_timeout_secs: u64,
    pub geo_db_path: Option<String>,
    pub psl_path: Option<String>,
    pub msgconvert_path: String,

    pub max_file_size: usize,
    pub max_decompressed_size: usize,
    pub max_files_in_zip: usize,
    pub max_compression_ratio: f64,
    pub max_filename_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            imap_host: None,
            imap_port: 993,
            imap_user: None,
            imap_password: None,
            skip_tls_verify: false,
            folder: "INBOX".to_string(),
            archive_folder: "Archive".to_string(),
            quarantine_folder: "Invalid".to_string(),
            processed_action: ProcessedAction::Move,
            zero_payload: ZeroPayloadPolicy::Archive,
            idle_refresh_secs: 540,
            fetch_chunk_size: 50,
            connect_attempts: 5,
            workers: 1,
            offline: false,
            nameservers: Vec::new(),
            dns_timeout_secs: 2,
            geo_db_path: None,
            psl_path: None,
            msgconvert_path: "msgconvert".to_string(),
            max_file_size: 10 * 1024 * 1024,
            max_decompressed_size: 100 * 1024 * 1024,
            max_files_in_zip: 1000,
            max_compression_ratio: 1000.0,
            max_filename_length: 256,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).map(|s| s.trim().to_string()).ok().filter(|s| !s.is_empty())
}

impl Config {
    /// Creates a new configuration by overriding the defaults with
    /// environment variables, then validating. If a variable is missing or
    /// empty, the default value is used.
    pub fn new() -> Result<Self> {
        let mut config = Config::default();

        config.imap_host = env_string("DMARC_IMAP_HOST");
        config.imap_port = env_parse("DMARC_IMAP_PORT", config.imap_port);
        config.imap_user = env_string("DMARC_IMAP_USER");
        config.imap_password = env_string("DMARC_IMAP_PASSWORD");
        config.skip_tls_verify = env_parse("DMARC_SKIP_TLS_VERIFY", config.skip_tls_verify);

        if let Some(folder) = env_string("DMARC_FOLDER") {
            config.folder = folder;
        }
        if let Some(folder) = env_string("DMARC_ARCHIVE_FOLDER") {
            config.archive_folder = folder;
        }
        if let Some(folder) = env_string("DMARC_QUARANTINE_FOLDER") {
            config.quarantine_folder = folder;
        }
        config.processed_action =
            env_parse("DMARC_PROCESSED_ACTION", config.processed_action);
        config.zero_payload = env_parse("DMARC_ON_EMPTY", config.zero_payload);

        config.idle_refresh_secs = env_parse("DMARC_IDLE_REFRESH_SECS", config.idle_refresh_secs);
        config.fetch_chunk_size = env_parse("DMARC_FETCH_CHUNK_SIZE", config.fetch_chunk_size);
        config.connect_attempts = env_parse("DMARC_CONNECT_ATTEMPTS", config.connect_attempts);
        config.workers = env_parse("DMARC_PARSE_WORKERS", config.workers);

        config.offline = env_parse("DMARC_OFFLINE", config.offline);
        config.nameservers = env_string("DMARC_NAMESERVERS")
            .map(|s| {
                s.split(',')
                    .filter_map(|part| part.trim().parse::<IpAddr>().ok())
                    .collect()
            })
            .unwrap_or_default();
        config.dns_timeout_secs = env_parse("DMARC_DNS_TIMEOUT_SECS", config.dns_timeout_secs);
        config.geo_db_path = env_string("DMARC_GEO_DB");
        config.psl_path = env_string("DMARC_PSL_FILE");
        if let Some(path) = env_string("DMARC_MSGCONVERT_PATH") {
            config.msgconvert_path = path;
        }

        config.max_file_size = env_parse("DMARC_MAX_FILE_SIZE", config.max_file_size);
        config.max_decompressed_size =
            env_parse("DMARC_MAX_DECOMPRESSED_SIZE", config.max_decompressed_size);
        config.max_files_in_zip = env_parse("DMARC_MAX_FILES_IN_ZIP", config.max_files_in_zip);
        config.max_compression_ratio =
            env_parse("DMARC_MAX_COMPRESSION_RATIO", config.max_compression_ratio);
        config.max_filename_length =
            env_parse("DMARC_MAX_FILENAME_LENGTH", config.max_filename_length);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_file_size > 500_000_000 {
            return Err(anyhow::anyhow!("Max file size too large (500MB limit)"));
        }
        // Servers drop unrefreshed IDLE sessions around the 29 minute mark;
        // the refresh interval must stay strictly below that horizon.
        if self.idle_refresh_secs >= 29 * 60 {
            return Err(anyhow::anyhow!("IDLE refresh interval must be below 29 minutes"));
        }
        Ok(())
    }
}

//! Error Handling Module
//!
//! This module defines the error taxonomy for the ingestion pipeline using the
//! `thiserror` crate. Transport errors trigger a reconnect cycle in the
//! watcher; parse errors are isolated to a single message; enrichment errors
//! degrade to null fields; reconciliation errors are logged per message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("MIME error: {0}")]
    Mime(#[from] mailparse::MailParseError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid format: {0}")]
    Format(String),

    #[error("file too large: {0}")]
    FileTooLarge(String),

    #[error("unsupported payload: {0}")]
    UnsupportedPayload(String),

    #[error("enrichment error: {0}")]
    Enrichment(String),

    #[error("reconciliation error: {0}")]
    Reconciliation(String),
}

impl From<imap::Error> for IngestError {
    fn from(e: imap::Error) -> Self {
        IngestError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

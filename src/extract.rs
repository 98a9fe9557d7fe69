//! Payload Extractor Module
//!
//! This module turns one raw email message into zero or more candidate report
//! payloads. Attachments are identified by content sniffing, never by file
//! extension, since real-world report mail is routinely mislabeled. It
//! enforces the same security envelope as archive handling everywhere:
//! file size limits, maximum decompressed size, file count, compression
//! ratio, member-name length, and path traversal prevention.

use crate::config::Config;
use crate::error::{IngestError, Result};
use flate2::read::GzDecoder;
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::process::Command;
use zip::ZipArchive;

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const OLE2_MAGIC: [u8; 4] = [0xd0, 0xcf, 0x11, 0xe0];

/// One candidate report payload pulled out of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Aggregate report XML, already decompressed.
    Xml(String),
    /// A complete MIME message that is itself a feedback report.
    Forensic(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadKind {
    Zip,
    Gzip,
    Ole2,
    Xml,
    Unknown,
}

fn classify(bytes: &[u8]) -> PayloadKind {
    if bytes.starts_with(&ZIP_MAGIC) {
        return PayloadKind::Zip;
    }
    if bytes.starts_with(&GZIP_MAGIC) {
        return PayloadKind::Gzip;
    }
    if bytes.starts_with(&OLE2_MAGIC) {
        return PayloadKind::Ole2;
    }
    let trimmed = skip_leading_noise(bytes);
    if trimmed.starts_with(b"<") {
        return PayloadKind::Xml;
    }
    PayloadKind::Unknown
}

fn skip_leading_noise(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(&[0xef, 0xbb, 0xbf]).unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Extracts candidate payloads from one raw message. A message with zero
/// recognized payloads yields an empty vector, not an error.
pub fn extract_payloads(raw: &[u8], config: &Config) -> Result<Vec<Payload>> {
    if raw.len() > config.max_file_size {
        return Err(IngestError::FileTooLarge(format!(
            "message size {} bytes exceeds limit of {} bytes",
            raw.len(),
            config.max_file_size
        )));
    }

    let mail = parse_mail(raw)?;
    if is_forensic_message(&mail) {
        return Ok(vec![Payload::Forensic(raw.to_vec())]);
    }

    let mut leaves = Vec::new();
    collect_leaves(&mail, &mut leaves);

    let mut payloads = Vec::new();
    for part in leaves {
        let bytes = match part.get_body_raw() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Skipping undecodable MIME part: {}", e);
                continue;
            }
        };
        sniff_into(&bytes, config, &mut payloads, 0)?;
    }
    Ok(payloads)
}

/// Extracts payloads from a local file: report archives and bare XML are
/// handled directly, anything else is treated as a raw message.
pub fn extract_from_file<P: AsRef<Path>>(path: P, config: &Config) -> Result<Vec<Payload>> {
    let bytes = std::fs::read(&path)?;
    if bytes.len() > config.max_file_size {
        return Err(IngestError::FileTooLarge(format!(
            "file {} too large",
            path.as_ref().display()
        )));
    }
    match classify(&bytes) {
        PayloadKind::Unknown => extract_payloads(&bytes, config),
        _ => {
            let mut payloads = Vec::new();
            sniff_into(&bytes, config, &mut payloads, 0)?;
            Ok(payloads)
        }
    }
}

/// Best-effort Message-ID for logging and failure records.
pub fn message_id(raw: &[u8]) -> String {
    mailparse::parse_headers(raw)
        .ok()
        .and_then(|(headers, _)| headers.get_first_value("Message-ID"))
        .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_string())
        .unwrap_or_default()
}

fn collect_leaves<'a, 'b>(part: &'b ParsedMail<'a>, out: &mut Vec<&'b ParsedMail<'a>>) {
    if part.subparts.is_empty() {
        out.push(part);
    } else {
        for sub in &part.subparts {
            collect_leaves(sub, out);
        }
    }
}

/// A message is itself a forensic report when it is a multipart/report with
/// report-type=feedback-report, carries a message/feedback-report part, or
/// holds a bare Feedback-Type block in its body.
fn is_forensic_message(mail: &ParsedMail) -> bool {
    let ctype = mail.ctype.mimetype.to_lowercase();
    if ctype == "multipart/report"
        && mail
            .ctype
            .params
            .get("report-type")
            .map(|v| v.eq_ignore_ascii_case("feedback-report"))
            .unwrap_or(false)
    {
        return true;
    }
    if any_part(mail, &|p| p.ctype.mimetype.eq_ignore_ascii_case("message/feedback-report")) {
        return true;
    }
    if mail.subparts.is_empty() && ctype.starts_with("text/") {
        if let Ok(body) = mail.get_body() {
            let head = &body[..body.len().min(4096)];
            return head.starts_with("Feedback-Type:") || head.contains("\nFeedback-Type:");
        }
    }
    false
}

fn any_part(mail: &ParsedMail, pred: &dyn Fn(&ParsedMail) -> bool) -> bool {
    if pred(mail) {
        return true;
    }
    mail.subparts.iter().any(|sub| any_part(sub, pred))
}

fn sniff_into(
    bytes: &[u8],
    config: &Config,
    payloads: &mut Vec<Payload>,
    depth: u8,
) -> Result<()> {
    // One level of container nesting is all legacy senders produce; deeper
    // nesting is treated as unrecognized.
    if depth > 2 {
        return Ok(());
    }
    match classify(bytes) {
        PayloadKind::Zip => {
            for xml in extract_zip_bytes(bytes, config)? {
                payloads.push(Payload::Xml(xml));
            }
        }
        PayloadKind::Gzip => {
            payloads.push(Payload::Xml(decompress_gzip(bytes, config)?));
        }
        PayloadKind::Xml => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            payloads.push(Payload::Xml(text));
        }
        PayloadKind::Ole2 => {
            if let Some(converted) = convert_legacy_container(bytes, config)? {
                let mail = parse_mail(&converted)?;
                if is_forensic_message(&mail) {
                    payloads.push(Payload::Forensic(converted));
                } else {
                    let mut leaves = Vec::new();
                    collect_leaves(&mail, &mut leaves);
                    for part in leaves {
                        if let Ok(inner) = part.get_body_raw() {
                            sniff_into(&inner, config, payloads, depth + 1)?;
                        }
                    }
                }
            }
        }
        PayloadKind::Unknown => {}
    }
    Ok(())
}

/// Extracts XML report members from an in-memory ZIP archive, enforcing the
/// archive security limits.
pub fn extract_zip_bytes(bytes: &[u8], config: &Config) -> Result<Vec<String>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    if archive.len() > config.max_files_in_zip {
        return Err(IngestError::Format("Too many files in archive".to_string()));
    }
    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut file_in_zip = archive.by_index(i)?;
        let inner_name = file_in_zip.name().to_string();
        // Prevent path traversal
        if inner_name.contains("..") || inner_name.starts_with('/') || inner_name.starts_with('\\')
        {
            return Err(IngestError::Format(format!(
                "Path traversal attempt detected: {}",
                inner_name
            )));
        }
        if inner_name.len() > config.max_filename_length {
            return Err(IngestError::Format("Filename too long".to_string()));
        }
        let compressed_size = file_in_zip.compressed_size();
        let uncompressed_size = file_in_zip.size();
        if compressed_size > 0 {
            let compression_ratio = uncompressed_size as f64 / compressed_size as f64;
            if compression_ratio > config.max_compression_ratio {
                return Err(IngestError::Format(format!(
                    "Suspicious compression ratio: {:.2}",
                    compression_ratio
                )));
            }
        }
        if uncompressed_size > config.max_decompressed_size as u64 {
            return Err(IngestError::FileTooLarge(
                "Decompressed size too large".to_string(),
            ));
        }
        let mut contents = String::new();
        file_in_zip.read_to_string(&mut contents)?;
        if contents.trim().is_empty() {
            continue;
        }
        extracted.push(contents);
    }
    Ok(extracted)
}

/// Decompresses a gzip member, bounded by the decompressed-size limit.
pub fn decompress_gzip(bytes: &[u8], config: &Config) -> Result<String> {
    let mut gz_decoder = GzDecoder::new(bytes);
    let mut contents = String::new();
    let len = gz_decoder
        .take(config.max_decompressed_size as u64 + 1)
        .read_to_string(&mut contents)?;
    if len > config.max_decompressed_size {
        return Err(IngestError::FileTooLarge(
            "Decompressed size too large".to_string(),
        ));
    }
    Ok(contents)
}

/// Invokes the external legacy-container converter with a scratch file path
/// and captures the MIME message it emits on stdout. A missing or failing
/// converter skips the attachment; it is never fatal.
fn convert_legacy_container(bytes: &[u8], config: &Config) -> Result<Option<Vec<u8>>> {
    let mut scratch = tempfile::NamedTempFile::new()?;
    scratch.write_all(bytes)?;
    scratch.flush()?;
    match Command::new(&config.msgconvert_path).arg(scratch.path()).output() {
        Ok(output) if output.status.success() && !output.stdout.is_empty() => {
            Ok(Some(output.stdout))
        }
        Ok(output) => {
            log::warn!(
                "Legacy container converter '{}' exited with {}; skipping attachment",
                config.msgconvert_path,
                output.status
            );
            Ok(None)
        }
        Err(e) => {
            log::warn!(
                "Legacy container converter '{}' unavailable: {}; skipping attachment",
                config.msgconvert_path,
                e
            );
            Ok(None)
        }
    }
}

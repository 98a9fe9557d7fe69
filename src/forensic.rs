//! Forensic Report Parser Module
//!
//! This module parses forensic/failure feedback reports: a MIME message
//! carrying a feedback-report block plus an embedded copy of the original
//! message. Vendor dialects omit standard fields freely, so every recognized
//! field falls back to an explicit empty value — a missing `Arrival-Date` or
//! `Reported-Domain` must never raise — and unrecognized fields are kept in
//! an open attribute map. Attachments inside the embedded sample are reduced
//! to content digests so downstream stores never persist large payloads.

use crate::enrich::EnrichmentCache;
use crate::error::{IngestError, Result};
use crate::models::{ForensicReport, SampleAttachment, SampleMessage};
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Parses one forensic report message and enriches its source IP.
pub fn parse_forensic_email(raw: &[u8], cache: &mut EnrichmentCache) -> Result<ForensicReport> {
    let mail = parse_mail(raw)?;

    let block = find_feedback_block(&mail).ok_or_else(|| {
        IngestError::Parse("no feedback-report block found in message".to_string())
    })?;
    let mut fields = header_multimap(block.as_bytes())?;

    let feedback_type = take_single(&mut fields, "feedback-type");
    let user_agent = take_single(&mut fields, "user-agent");
    let version = take_single(&mut fields, "version");

    // Historically the most frequent crash cause: absent Arrival-Date. It is
    // synthesized as empty, with Received-Date as a dialect fallback.
    let arrival_date = {
        let primary = take_single(&mut fields, "arrival-date");
        if primary.is_empty() {
            take_single(&mut fields, "received-date")
        } else {
            primary
        }
    };
    let arrival_date_utc = parse_date(&arrival_date);

    let source_ip = take_single(&mut fields, "source-ip");
    let delivery_result = take_single(&mut fields, "delivery-result");
    let original_envelope_id = take_single(&mut fields, "original-envelope-id");
    let original_mail_from = take_single(&mut fields, "original-mail-from");
    let authentication_results = take_multiple(&mut fields, "authentication-results");
    let auth_failure = take_multiple(&mut fields, "auth-failure");
    let original_rcpt_to = take_multiple(&mut fields, "original-rcpt-to");
    let reported_domain = take_multiple(&mut fields, "reported-domain");

    if source_ip.is_empty() {
        return Err(IngestError::Parse("forensic report carries no Source-IP".to_string()));
    }
    if arrival_date.is_empty() && reported_domain.is_empty() {
        return Err(IngestError::Parse(
            "forensic report carries neither arrival date nor reported domain".to_string(),
        ));
    }

    let sample = match find_sample(&mail) {
        Some(part) => decompose_sample(part).unwrap_or_else(|e| {
            log::warn!("Embedded sample could not be decomposed: {}", e);
            SampleMessage::default()
        }),
        None => SampleMessage::default(),
    };

    let enrichment = cache.resolve_ip(&source_ip);

    Ok(ForensicReport {
        feedback_type,
        user_agent,
        version,
        arrival_date,
        arrival_date_utc,
        source_ip,
        source_reverse_dns: enrichment.reverse_dns,
        source_country: enrichment.country,
        authentication_results,
        auth_failure,
        delivery_result,
        original_envelope_id,
        original_mail_from,
        original_rcpt_to,
        reported_domain,
        extensions: fields,
        sample,
    })
}

/// Locates the feedback-report header block: a dedicated MIME part when
/// present, otherwise a bare block in the message body.
fn find_feedback_block(mail: &ParsedMail) -> Option<String> {
    if let Some(part) = find_part(mail, "message/feedback-report") {
        return part.get_body().ok();
    }
    if mail.subparts.is_empty() {
        if let Ok(body) = mail.get_body() {
            if body.starts_with("Feedback-Type:") || body.contains("\nFeedback-Type:") {
                return Some(body);
            }
        }
    }
    None
}

fn find_part<'a, 'b>(mail: &'b ParsedMail<'a>, mimetype: &str) -> Option<&'b ParsedMail<'a>> {
    if mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
        return Some(mail);
    }
    mail.subparts.iter().find_map(|sub| find_part(sub, mimetype))
}

fn find_sample<'a, 'b>(mail: &'b ParsedMail<'a>) -> Option<&'b ParsedMail<'a>> {
    find_part(mail, "message/rfc822").or_else(|| find_part(mail, "text/rfc822-headers"))
}

/// Folds a header-formatted block into a lowercased multimap.
fn header_multimap(block: &[u8]) -> Result<BTreeMap<String, Vec<String>>> {
    let (headers, _) = mailparse::parse_headers(block)?;
    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for header in headers.iter() {
        let name = header.get_key_ref().to_ascii_lowercase();
        fields.entry(name).or_default().push(header.get_value().trim().to_string());
    }
    Ok(fields)
}

fn take_single(fields: &mut BTreeMap<String, Vec<String>>, name: &str) -> String {
    fields
        .remove(name)
        .and_then(|mut values| if values.is_empty() { None } else { Some(values.remove(0)) })
        .unwrap_or_default()
}

fn take_multiple(fields: &mut BTreeMap<String, Vec<String>>, name: &str) -> Vec<String> {
    fields.remove(name).unwrap_or_default()
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.into());
    }
    mailparse::dateparse(value)
        .ok()
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
}

/// Decomposes the embedded original message into headers, body, and hashed
/// attachments.
fn decompose_sample(part: &ParsedMail) -> Result<SampleMessage> {
    let embedded_bytes = match part.get_body_raw() {
        Ok(bytes) => bytes,
        // Transfer decoding failed; fall back to the raw part body.
        Err(_) => part.raw_bytes.to_vec(),
    };
    let embedded = parse_mail(&embedded_bytes)?;

    let headers: Vec<(String, String)> = embedded
        .headers
        .iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect();
    let subject = embedded.headers.get_first_value("Subject").unwrap_or_default();

    let mut leaves = Vec::new();
    collect_leaves(&embedded, &mut leaves);

    let mut body = String::new();
    let mut attachments = Vec::new();
    for leaf in leaves {
        let filename = attachment_filename(leaf);
        let is_text = leaf.ctype.mimetype.to_lowercase().starts_with("text/");
        if body.is_empty() && is_text && filename.is_none() {
            body = leaf.get_body().unwrap_or_default();
            continue;
        }
        // Every attachment is hashed whether or not its content decodes;
        // undecodable bytes are digested raw rather than dropped.
        let content = leaf.get_body_raw().unwrap_or_else(|_| leaf.raw_bytes.to_vec());
        attachments.push(SampleAttachment {
            filename: filename.unwrap_or_default(),
            content_type: leaf.ctype.mimetype.clone(),
            sha256: hex::encode(Sha256::digest(&content)),
        });
    }

    Ok(SampleMessage { headers, subject, body, attachments })
}

fn attachment_filename(part: &ParsedMail) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoSnapshot;
    use crate::psl::PslSnapshot;
    use std::sync::Arc;

    fn offline_cache() -> EnrichmentCache {
        EnrichmentCache::new(None, Arc::new(GeoSnapshot::empty()), Arc::new(PslSnapshot::builtin()))
    }

    fn arf_message(feedback_block: &str) -> Vec<u8> {
        format!(
            "From: abuse@mail.example.org\r\n\
             To: dmarc-failures@example.com\r\n\
             Subject: FW: Earn money\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/report; report-type=feedback-report; boundary=\"p1\"\r\n\r\n\
             --p1\r\n\
             Content-Type: text/plain\r\n\r\n\
             This is an authentication failure report.\r\n\
             --p1\r\n\
             Content-Type: message/feedback-report\r\n\r\n\
             {}\r\n\
             --p1\r\n\
             Content-Type: message/rfc822\r\n\r\n\
             From: <somespammer@example.net>\r\n\
             To: <user@example.com>\r\n\
             Subject: Earn money\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/mixed; boundary=\"m1\"\r\n\r\n\
             --m1\r\n\
             Content-Type: text/plain\r\n\r\n\
             Spam Spam Spam\r\n\
             --m1\r\n\
             Content-Type: application/pdf; name=\"invoice.pdf\"\r\n\
             Content-Disposition: attachment; filename=\"invoice.pdf\"\r\n\r\n\
             %PDF-1.4 fake\r\n\
             --m1--\r\n\
             --p1--\r\n",
            feedback_block
        )
        .into_bytes()
    }

    const FULL_BLOCK: &str = "Feedback-Type: auth-failure\r\n\
        User-Agent: ReportGen/1.0\r\n\
        Version: 1\r\n\
        Source-IP: 203.0.113.5\r\n\
        Arrival-Date: Thu, 14 Dec 2023 16:16:15 +0000\r\n\
        Reported-Domain: example.com\r\n\
        Authentication-Results: mx.example.com; spf=fail smtp.mailfrom=example.net\r\n\
        Auth-Failure: spf\r\n\
        Delivery-Result: reject\r\n\
        Original-Mail-From: <somespammer@example.net>\r\n\
        Original-Rcpt-To: <user@example.com>\r\n\
        Abuse-Type: complaint";

    #[test]
    fn test_full_report_parses() {
        let report = parse_forensic_email(&arf_message(FULL_BLOCK), &mut offline_cache()).unwrap();
        assert_eq!(report.feedback_type, "auth-failure");
        assert_eq!(report.source_ip, "203.0.113.5");
        assert_eq!(report.reported_domain, vec!["example.com".to_string()]);
        assert_eq!(report.delivery_result, "reject");
        assert_eq!(report.auth_failure, vec!["spf".to_string()]);
        assert!(report.arrival_date_utc.is_some());
        // Unrecognized fields land in the open attribute map.
        assert_eq!(report.extensions.get("abuse-type").unwrap(), &vec!["complaint".to_string()]);
        // No resolver configured: enrichment degrades to null fields.
        assert_eq!(report.source_reverse_dns, None);
        assert_eq!(report.source_country, None);
    }

    #[test]
    fn test_missing_arrival_date_is_synthesized_empty() {
        let block = "Feedback-Type: auth-failure\r\n\
            Source-IP: 203.0.113.5\r\n\
            Reported-Domain: example.com";
        let report = parse_forensic_email(&arf_message(block), &mut offline_cache()).unwrap();
        assert_eq!(report.arrival_date, "");
        assert_eq!(report.arrival_date_utc, None);
    }

    #[test]
    fn test_received_date_dialect_fallback() {
        let block = "Feedback-Type: auth-failure\r\n\
            Source-IP: 203.0.113.5\r\n\
            Received-Date: Thu, 14 Dec 2023 16:16:15 +0000";
        let report = parse_forensic_email(&arf_message(block), &mut offline_cache()).unwrap();
        assert!(!report.arrival_date.is_empty());
        assert!(report.arrival_date_utc.is_some());
    }

    #[test]
    fn test_missing_source_ip_is_invalid() {
        let block = "Feedback-Type: auth-failure\r\n\
            Reported-Domain: example.com";
        assert!(parse_forensic_email(&arf_message(block), &mut offline_cache()).is_err());
    }

    #[test]
    fn test_source_ip_alone_is_not_enough() {
        let block = "Feedback-Type: auth-failure\r\n\
            Source-IP: 203.0.113.5";
        assert!(parse_forensic_email(&arf_message(block), &mut offline_cache()).is_err());
    }

    #[test]
    fn test_sample_decomposition_hashes_attachments() {
        let report = parse_forensic_email(&arf_message(FULL_BLOCK), &mut offline_cache()).unwrap();
        assert_eq!(report.sample.subject, "Earn money");
        assert!(report.sample.body.contains("Spam Spam Spam"));
        assert_eq!(report.sample.attachments.len(), 1);
        let attachment = &report.sample.attachments[0];
        assert_eq!(attachment.filename, "invoice.pdf");
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.sha256.len(), 64);
    }

    #[test]
    fn test_bare_body_feedback_block() {
        let raw = format!(
            "From: abuse@example.org\r\n\
             Subject: report\r\n\
             Content-Type: text/plain\r\n\r\n\
             {}\r\n",
            FULL_BLOCK
        );
        let report = parse_forensic_email(raw.as_bytes(), &mut offline_cache()).unwrap();
        assert_eq!(report.source_ip, "203.0.113.5");
    }
}

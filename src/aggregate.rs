//! Aggregate Report Parser Module
//!
//! This module parses DMARC aggregate XML into the canonical record model.
//! Real-world senders emit malformed preambles, absent fields, and invalid
//! enumeration values, so every field extraction defaults on absence and the
//! preamble is sanitized before parsing. A recursion depth limit and the
//! DOCTYPE entity check protect against expansion attacks such as the
//! Billion Laughs attack.

use crate::enrich::EnrichmentCache;
use crate::error::{IngestError, Result};
use crate::models::{
    AggregateRecord, AggregateReport, AlignmentMode, DkimAuthResult, DkimVerdict, Disposition,
    PolicyOverrideReason, PolicyType, PublishedPolicy, ReportMetadata, SpfAuthResult, SpfVerdict,
};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

const MAX_DEPTH: u32 = 20;

/// Parses aggregate XML and normalizes it: disposition coercion, FQDN org
/// names reduced to their organizational domain, alignment flags, source-IP
/// enrichment. XML that cannot be parsed even after preamble stripping is a
/// parse error for this payload only, never a crash.
pub fn parse_aggregate_xml(
    xml_content: &str,
    cache: &mut EnrichmentCache,
) -> Result<AggregateReport> {
    let cleaned = strip_preamble(xml_content)?;

    let mut reader = Reader::from_str(&cleaned);
    reader.config_mut().trim_text(true);

    let mut metadata = ReportMetadata::default();
    let mut policy = PublishedPolicy { pct: 100, ..Default::default() };
    let mut records = Vec::new();

    let mut depth: u32 = 0;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(IngestError::Parse(
                        "XML recursion depth limit exceeded".to_string(),
                    ));
                }
                match e.name().as_ref() {
                    b"report_metadata" => {
                        metadata = parse_metadata(&mut reader)?;
                        depth = depth.saturating_sub(1);
                    }
                    b"policy_published" => {
                        policy = parse_policy_published(&mut reader)?;
                        depth = depth.saturating_sub(1);
                    }
                    b"record" => {
                        records.push(parse_record(&mut reader)?);
                        depth = depth.saturating_sub(1);
                    }
                    _ => {}
                }
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IngestError::Xml(e)),
            _ => (),
        }
    }

    if metadata.report_id.is_empty() && policy.domain.is_empty() && records.is_empty() {
        return Err(IngestError::Parse(
            "no aggregate report elements found".to_string(),
        ));
    }

    let mut report = AggregateReport { metadata, policy, records };
    normalize(&mut report, cache);
    Ok(report)
}

/// Removes DOCTYPE blocks and any leading junk before the first tag. A
/// DOCTYPE defining two or more entities is rejected outright.
fn strip_preamble(xml_content: &str) -> Result<String> {
    let without_doctype = if let Some(start) = xml_content.find("<!DOCTYPE") {
        if let Some(end) = xml_content[start..].find("]>") {
            let doctype = &xml_content[start..start + end + 2];
            let entity_count = doctype.matches("<!ENTITY").count();
            if entity_count >= 2 {
                return Err(IngestError::Parse("recursive entities detected".to_string()));
            }
            format!("{}{}", &xml_content[..start], &xml_content[start + end + 2..])
        } else if let Some(end) = xml_content[start..].find('>') {
            format!("{}{}", &xml_content[..start], &xml_content[start + end + 1..])
        } else {
            xml_content.to_string()
        }
    } else {
        xml_content.to_string()
    };
    let trimmed = without_doctype.trim_start();
    match trimmed.find('<') {
        Some(pos) => Ok(trimmed[pos..].to_string()),
        None => Err(IngestError::Parse("no XML content found".to_string())),
    }
}

/// Parses the `<report_metadata>` element.
fn parse_metadata(reader: &mut Reader<&[u8]>) -> Result<ReportMetadata> {
    let mut metadata = ReportMetadata::default();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"org_name" => {
                    metadata.org_name = reader.read_text(e.name())?.trim().to_string();
                }
                b"email" => {
                    metadata.email = reader.read_text(e.name())?.trim().to_string();
                }
                b"extra_contact_info" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    if !text.is_empty() {
                        metadata.extra_contact_info = Some(text);
                    }
                }
                b"report_id" => {
                    metadata.report_id = reader.read_text(e.name())?.trim().to_string();
                }
                b"begin" => {
                    metadata.date_range.begin =
                        reader.read_text(e.name())?.trim().parse().unwrap_or(0);
                }
                b"end" => {
                    metadata.date_range.end =
                        reader.read_text(e.name())?.trim().parse().unwrap_or(0);
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"report_metadata" {
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IngestError::Xml(e)),
            _ => {}
        }
    }
    Ok(metadata)
}

/// Parses the `<policy_published>` element.
fn parse_policy_published(reader: &mut Reader<&[u8]>) -> Result<PublishedPolicy> {
    let mut policy = PublishedPolicy { pct: 100, ..Default::default() };
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"domain" => {
                    policy.domain = reader.read_text(e.name())?.trim().to_lowercase();
                }
                b"adkim" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    policy.adkim = text.parse().unwrap_or(AlignmentMode::Relaxed);
                }
                b"aspf" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    policy.aspf = text.parse().unwrap_or(AlignmentMode::Relaxed);
                }
                b"p" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    policy.policy = text.parse().unwrap_or(PolicyType::None);
                }
                b"sp" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    policy.subdomain_policy = text.parse().unwrap_or(PolicyType::None);
                }
                b"pct" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    policy.pct = text.parse().unwrap_or(100);
                }
                b"fo" => {
                    policy.fo = reader.read_text(e.name())?.trim().to_string();
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"policy_published" {
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IngestError::Xml(e)),
            _ => {}
        }
    }
    Ok(policy)
}

/// Parses one `<record>` element: row, identifiers, and auth_results.
fn parse_record(reader: &mut Reader<&[u8]>) -> Result<AggregateRecord> {
    let mut record = AggregateRecord {
        source_ip: String::new(),
        source_reverse_dns: None,
        source_country: None,
        count: 0,
        policy_evaluated: Default::default(),
        header_from: String::new(),
        envelope_from: None,
        envelope_to: None,
        dkim: Vec::new(),
        spf: Vec::new(),
        dkim_aligned: false,
        spf_aligned: false,
    };
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"source_ip" => {
                    record.source_ip = reader.read_text(e.name())?.trim().to_string();
                }
                b"count" => {
                    record.count = reader.read_text(e.name())?.trim().parse().unwrap_or(0);
                }
                b"policy_evaluated" => {
                    record.policy_evaluated = parse_policy_evaluated(reader)?;
                }
                b"header_from" => {
                    record.header_from = reader.read_text(e.name())?.trim().to_lowercase();
                }
                b"envelope_from" => {
                    let text = reader.read_text(e.name())?.trim().to_lowercase();
                    if !text.is_empty() {
                        record.envelope_from = Some(text);
                    }
                }
                b"envelope_to" => {
                    let text = reader.read_text(e.name())?.trim().to_lowercase();
                    if !text.is_empty() {
                        record.envelope_to = Some(text);
                    }
                }
                b"dkim" => {
                    record.dkim.push(parse_dkim(reader)?);
                }
                b"spf" => {
                    record.spf.push(parse_spf(reader)?);
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"record" {
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IngestError::Xml(e)),
            _ => {}
        }
    }
    Ok(record)
}

/// Parses the `<policy_evaluated>` element, including override reasons.
fn parse_policy_evaluated(
    reader: &mut Reader<&[u8]>,
) -> Result<crate::models::PolicyEvaluated> {
    let mut evaluated = crate::models::PolicyEvaluated::default();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"disposition" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    evaluated.disposition = text.parse().unwrap_or(Disposition::None);
                }
                b"dkim" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    evaluated.dkim = text.parse().unwrap_or(DkimVerdict::None);
                }
                b"spf" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    evaluated.spf = text.parse().unwrap_or(SpfVerdict::None);
                }
                b"reason" => {
                    evaluated.reasons.push(parse_reason(reader)?);
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"policy_evaluated" {
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IngestError::Xml(e)),
            _ => {}
        }
    }
    Ok(evaluated)
}

/// Parses one `<reason>` override element.
fn parse_reason(reader: &mut Reader<&[u8]>) -> Result<PolicyOverrideReason> {
    let mut reason = PolicyOverrideReason::default();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"type" => {
                    reason.kind = reader.read_text(e.name())?.trim().to_string();
                }
                b"comment" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    if !text.is_empty() {
                        reason.comment = Some(text);
                    }
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"reason" {
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IngestError::Xml(e)),
            _ => {}
        }
    }
    Ok(reason)
}

/// Parses one `<dkim>` auth result.
fn parse_dkim(reader: &mut Reader<&[u8]>) -> Result<DkimAuthResult> {
    let mut domain = String::new();
    let mut selector = String::new();
    let mut result_dkim = DkimVerdict::None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"domain" => {
                    domain = reader.read_text(e.name())?.trim().to_lowercase();
                }
                b"selector" => {
                    selector = reader.read_text(e.name())?.trim().to_string();
                }
                b"result" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    result_dkim = text.parse().unwrap_or(DkimVerdict::None);
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"dkim" {
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IngestError::Xml(e)),
            _ => {}
        }
    }
    Ok(DkimAuthResult { domain, selector, result: result_dkim })
}

/// Parses one `<spf>` auth result.
fn parse_spf(reader: &mut Reader<&[u8]>) -> Result<SpfAuthResult> {
    let mut domain = String::new();
    let mut scope = String::new();
    let mut result_spf = SpfVerdict::None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"domain" => {
                    domain = reader.read_text(e.name())?.trim().to_lowercase();
                }
                b"scope" => {
                    scope = reader.read_text(e.name())?.trim().to_string();
                }
                b"result" => {
                    let text = reader.read_text(e.name())?.trim().to_string();
                    result_spf = text.parse().unwrap_or(SpfVerdict::None);
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"spf" {
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IngestError::Xml(e)),
            _ => {}
        }
    }
    Ok(SpfAuthResult { domain, scope, result: result_spf })
}

fn normalize(report: &mut AggregateReport, cache: &mut EnrichmentCache) {
    if looks_like_hostname(&report.metadata.org_name) {
        report.metadata.org_name = cache.organizational_domain(&report.metadata.org_name);
    }
    // Some senders emit reversed ranges; clamp instead of rejecting.
    if report.metadata.date_range.end < report.metadata.date_range.begin {
        report.metadata.date_range.end = report.metadata.date_range.begin;
    }

    let published = report.policy.domain.clone();
    let adkim = report.policy.adkim.clone();
    let aspf = report.policy.aspf.clone();
    for record in &mut report.records {
        let enrichment = cache.resolve_ip(&record.source_ip);
        record.source_reverse_dns = enrichment.reverse_dns;
        record.source_country = enrichment.country;
        record.dkim_aligned = record
            .dkim
            .iter()
            .any(|d| d.result == DkimVerdict::Pass && aligned(&d.domain, &published, &adkim, cache));
        record.spf_aligned = record
            .spf
            .iter()
            .any(|s| s.result == SpfVerdict::Pass && aligned(&s.domain, &published, &aspf, cache));
    }
}

/// Organizational-domain comparison under the published alignment mode.
fn aligned(
    candidate: &str,
    published: &str,
    mode: &AlignmentMode,
    cache: &mut EnrichmentCache,
) -> bool {
    if candidate.is_empty() || published.is_empty() {
        return false;
    }
    match mode {
        AlignmentMode::Strict => candidate.eq_ignore_ascii_case(published),
        AlignmentMode::Relaxed => {
            cache.organizational_domain(candidate) == cache.organizational_domain(published)
        }
    }
}

fn looks_like_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.contains('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
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

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feedback>
  <report_metadata>
    <org_name>mail.example.com</org_name>
    <email>noreply-dmarc@example.com</email>
    <report_id>8943021847test</report_id>
    <date_range><begin>1706745600</begin><end>1706831999</end></date_range>
  </report_metadata>
  <policy_published>
    <domain>sender.example</domain>
    <adkim>r</adkim>
    <aspf>r</aspf>
    <p>reject</p>
    <sp>quarantine</sp>
    <pct>100</pct>
    <fo>1</fo>
  </policy_published>
  <record>
    <row>
      <source_ip>203.0.113.5</source_ip>
      <count>17</count>
      <policy_evaluated>
        <disposition>pass</disposition>
        <dkim>pass</dkim>
        <spf>fail</spf>
        <reason><type>forwarded</type><comment>mailing list</comment></reason>
      </policy_evaluated>
    </row>
    <identifiers>
      <header_from>sender.example</header_from>
      <envelope_from>bounce.sender.example</envelope_from>
    </identifiers>
    <auth_results>
      <dkim>
        <domain>mail.sender.example</domain>
        <selector>s1</selector>
        <result>pass</result>
      </dkim>
      <spf>
        <domain>other.example</domain>
        <scope>mfrom</scope>
        <result>pass</result>
      </spf>
    </auth_results>
  </record>
</feedback>"#;

    #[test]
    fn test_full_report_parses_and_normalizes() {
        let report = parse_aggregate_xml(SAMPLE, &mut offline_cache()).unwrap();

        // FQDN org names reduce to the organizational domain.
        assert_eq!(report.metadata.org_name, "example.com");
        assert_eq!(report.metadata.report_id, "8943021847test");
        assert_eq!(report.metadata.date_range.begin, 1706745600);
        assert_eq!(report.policy.policy, PolicyType::Reject);
        assert_eq!(report.policy.subdomain_policy, PolicyType::Quarantine);
        assert_eq!(report.policy.fo, "1");

        let record = &report.records[0];
        assert_eq!(record.source_ip, "203.0.113.5");
        assert_eq!(record.count, 17);
        // Invalid `pass` disposition coerces to none.
        assert_eq!(record.policy_evaluated.disposition, Disposition::None);
        assert_eq!(record.policy_evaluated.reasons[0].kind, "forwarded");
        assert_eq!(record.header_from, "sender.example");
        assert_eq!(record.envelope_from.as_deref(), Some("bounce.sender.example"));
        assert_eq!(record.dkim[0].selector, "s1");
        assert_eq!(record.spf[0].scope, "mfrom");
    }

    #[test]
    fn test_alignment_uses_organizational_domain() {
        let mut cache = EnrichmentCache::new(
            None,
            Arc::new(GeoSnapshot::empty()),
            Arc::new(PslSnapshot::from_rules("com\nexample\n")),
        );
        let report = parse_aggregate_xml(SAMPLE, &mut cache).unwrap();
        let record = &report.records[0];
        // mail.sender.example reduces to sender.example under relaxed adkim.
        assert!(record.dkim_aligned);
        // other.example does not align with sender.example.
        assert!(!record.spf_aligned);
    }

    #[test]
    fn test_missing_fields_default() {
        let xml = r#"<feedback>
          <record>
            <row><source_ip>192.0.2.1</source_ip></row>
          </record>
        </feedback>"#;
        let report = parse_aggregate_xml(xml, &mut offline_cache()).unwrap();
        let record = &report.records[0];
        assert_eq!(record.count, 0);
        assert_eq!(record.policy_evaluated.disposition, Disposition::None);
        assert!(record.dkim.is_empty());
        assert!(!record.dkim_aligned);
    }

    #[test]
    fn test_doctype_is_stripped() {
        let xml = format!(
            "<!DOCTYPE foo [\n<!ENTITY xxe SYSTEM \"file:///etc/passwd\">\n]>\n{}",
            SAMPLE
        );
        let report = parse_aggregate_xml(&xml, &mut offline_cache()).unwrap();
        assert!(!report.records[0].source_ip.contains("/etc/passwd"));
    }

    #[test]
    fn test_entity_bomb_rejected() {
        let xml = r#"<!DOCTYPE lolz [
            <!ENTITY lol "lol">
            <!ENTITY lol2 "&lol;&lol;">
        ]>
        <feedback><record><row><source_ip>1.2.3.4</source_ip></row></record></feedback>"#;
        assert!(parse_aggregate_xml(xml, &mut offline_cache()).is_err());
    }

    #[test]
    fn test_non_report_xml_is_a_parse_error() {
        assert!(parse_aggregate_xml("<html><body/></html>", &mut offline_cache()).is_err());
        assert!(parse_aggregate_xml("not xml at all", &mut offline_cache()).is_err());
    }

    #[test]
    fn test_reversed_date_range_clamped() {
        let xml = r#"<feedback>
          <report_metadata>
            <report_id>r1</report_id>
            <date_range><begin>200</begin><end>100</end></date_range>
          </report_metadata>
        </feedback>"#;
        let report = parse_aggregate_xml(xml, &mut offline_cache()).unwrap();
        assert_eq!(report.metadata.date_range.begin, 200);
        assert_eq!(report.metadata.date_range.end, 200);
    }
}

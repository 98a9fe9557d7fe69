//! Data Models Module
//!
//! This module defines the canonical record model the pipeline normalizes
//! reports into: aggregate reports (metadata, published policy, per-source
//! records), forensic reports (permissive feedback fields plus the embedded
//! sample), and the per-message outcome types handed to sinks. It also
//! provides implementations for converting from strings and default values.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ReportMetadata {
    /// Reporting organization, reduced to its organizational domain when the
    /// sender put a fully-qualified hostname here.
    pub org_name: String,
    pub email: String,
    pub extra_contact_info: Option<String>,
    pub report_id: String,
    pub date_range: DateRange,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PublishedPolicy {
    pub domain: String,
    pub adkim: AlignmentMode,
    pub aspf: AlignmentMode,
    pub policy: PolicyType,
    pub subdomain_policy: PolicyType,
    pub pct: u8,
    pub fo: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AggregateReport {
    pub metadata: ReportMetadata,
    pub policy: PublishedPolicy,
    pub records: Vec<AggregateRecord>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AggregateRecord {
    pub source_ip: String,
    pub source_reverse_dns: Option<String>,
    pub source_country: Option<String>,
    pub count: u32,
    pub policy_evaluated: PolicyEvaluated,
    pub header_from: String,
    pub envelope_from: Option<String>,
    pub envelope_to: Option<String>,
    pub dkim: Vec<DkimAuthResult>,
    pub spf: Vec<SpfAuthResult>,
    pub dkim_aligned: bool,
    pub spf_aligned: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PolicyEvaluated {
    pub disposition: Disposition,
    pub dkim: DkimVerdict,
    pub spf: SpfVerdict,
    pub reasons: Vec<PolicyOverrideReason>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PolicyOverrideReason {
    pub kind: String,
    pub comment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DkimAuthResult {
    pub domain: String,
    pub selector: String,
    pub result: DkimVerdict,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct SpfAuthResult {
    pub domain: String,
    pub scope: String,
    pub result: SpfVerdict,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct DateRange {
    pub begin: i64,
    pub end: i64,
}

/// Feedback/failure report. Recognized-but-absent fields are explicit empty
/// values, never parse errors; unrecognized fields land in `extensions`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ForensicReport {
    pub feedback_type: String,
    pub user_agent: String,
    pub version: String,
    /// Raw Arrival-Date header value; empty string when the sender omitted it.
    pub arrival_date: String,
    pub arrival_date_utc: Option<DateTime<Utc>>,
    pub source_ip: String,
    pub source_reverse_dns: Option<String>,
    pub source_country: Option<String>,
    pub authentication_results: Vec<String>,
    pub auth_failure: Vec<String>,
    pub delivery_result: String,
    pub original_envelope_id: String,
    pub original_mail_from: String,
    pub original_rcpt_to: Vec<String>,
    pub reported_domain: Vec<String>,
    pub extensions: BTreeMap<String, Vec<String>>,
    pub sample: SampleMessage,
}

/// The original message embedded in a forensic report, decomposed so large
/// attachment payloads never need to be persisted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct SampleMessage {
    pub headers: Vec<(String, String)>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<SampleAttachment>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct SampleAttachment {
    pub filename: String,
    pub content_type: String,
    /// SHA-256 of the decoded content (raw bytes when decoding failed),
    /// used for cross-report deduplication.
    pub sha256: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ParseFailure {
    pub message_id: String,
    pub reason: String,
}

/// Terminal result of parsing one payload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParseOutcome {
    Aggregate(AggregateReport),
    Forensic(ForensicReport),
    Failure(ParseFailure),
}

impl ParseOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ParseOutcome::Failure(_))
    }
}

/// Terminal result of processing one mailbox message: every payload outcome,
/// in payload order, plus the identifiers reconciliation needs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MessageOutcome {
    pub uid: u32,
    pub message_id: String,
    pub outcomes: Vec<ParseOutcome>,
}

impl MessageOutcome {
    pub fn failed(&self) -> bool {
        self.outcomes.iter().any(|o| o.is_failure())
    }

    pub fn empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub enum DkimVerdict {
    #[default]
    None,
    Pass,
    Fail,
    Neutral,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub enum SpfVerdict {
    #[default]
    None,
    Pass,
    Fail,
    Neutral,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub enum AlignmentMode {
    #[default]
    Relaxed,
    Strict,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub enum PolicyType {
    #[default]
    None,
    Quarantine,
    Reject,
}

/// Applied disposition of an aggregate record. Always one of these three;
/// the parser coerces anything else (notably the invalid `pass` emitted by
/// some senders) to `None`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub enum Disposition {
    #[default]
    None,
    Quarantine,
    Reject,
}

impl fmt::Display for DkimVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DkimVerdict::None => write!(f, "none"),
            DkimVerdict::Pass => write!(f, "pass"),
            DkimVerdict::Fail => write!(f, "fail"),
            DkimVerdict::Neutral => write!(f, "neutral"),
        }
    }
}

impl fmt::Display for SpfVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpfVerdict::None => write!(f, "none"),
            SpfVerdict::Pass => write!(f, "pass"),
            SpfVerdict::Fail => write!(f, "fail"),
            SpfVerdict::Neutral => write!(f, "neutral"),
        }
    }
}

impl fmt::Display for AlignmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentMode::Relaxed => write!(f, "relaxed"),
            AlignmentMode::Strict => write!(f, "strict"),
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyType::None => write!(f, "none"),
            PolicyType::Quarantine => write!(f, "quarantine"),
            PolicyType::Reject => write!(f, "reject"),
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::None => write!(f, "none"),
            Disposition::Quarantine => write!(f, "quarantine"),
            Disposition::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for DkimVerdict {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pass" => Ok(DkimVerdict::Pass),
            "fail" => Ok(DkimVerdict::Fail),
            "neutral" => Ok(DkimVerdict::Neutral),
            "none" => Ok(DkimVerdict::None),
            _ => Err(format!("Invalid DKIM verdict: {}", s)),
        }
    }
}

impl FromStr for SpfVerdict {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pass" => Ok(SpfVerdict::Pass),
            "fail" => Ok(SpfVerdict::Fail),
            "neutral" => Ok(SpfVerdict::Neutral),
            "none" => Ok(SpfVerdict::None),
            _ => Err(format!("Invalid SPF verdict: {}", s)),
        }
    }
}

impl FromStr for AlignmentMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "r" | "relaxed" => Ok(AlignmentMode::Relaxed),
            "s" | "strict" => Ok(AlignmentMode::Strict),
            _ => Err(format!("Invalid alignment mode: {}", s)),
        }
    }
}

impl FromStr for PolicyType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(PolicyType::None),
            "quarantine" => Ok(PolicyType::Quarantine),
            "reject" => Ok(PolicyType::Reject),
            _ => Err(format!("Invalid policy type: {}", s)),
        }
    }
}

impl FromStr for Disposition {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            // "pass" is invalid per the aggregate schema but common in the
            // wild; it is treated as no action taken.
            "none" | "pass" => Ok(Disposition::None),
            "quarantine" => Ok(Disposition::Quarantine),
            "reject" => Ok(Disposition::Reject),
            _ => Err(format!("Invalid disposition: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_coerces_pass_to_none() {
        assert_eq!("pass".parse::<Disposition>().unwrap(), Disposition::None);
        assert_eq!("PASS".parse::<Disposition>().unwrap(), Disposition::None);
        assert_eq!("reject".parse::<Disposition>().unwrap(), Disposition::Reject);
        assert!("sideline".parse::<Disposition>().is_err());
    }

    #[test]
    fn test_alignment_mode_short_forms() {
        assert_eq!("r".parse::<AlignmentMode>().unwrap(), AlignmentMode::Relaxed);
        assert_eq!("s".parse::<AlignmentMode>().unwrap(), AlignmentMode::Strict);
    }
}

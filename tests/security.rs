/// Security and pipeline tests for dmarc-ingest.
///
/// This suite verifies that the ingestion pipeline is protected against
/// common attacks carried in report mail:
/// - ZIP bombs (decompression and file count limits)
/// - XML External Entity (XXE) injection
/// - Directory traversal in archive member names
/// - Billion Laughs (recursive XML entity) attacks
/// and that a whole mailbox batch reaches terminal outcomes even when some
/// messages are poisoned.
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Instant;

use dmarc_ingest::batch::{self, RawMessage};
use dmarc_ingest::models::{Disposition, ParseOutcome};
use dmarc_ingest::watcher::{plan_reconciliation, ReconcileAction};
use dmarc_ingest::{extract, parse_aggregate_xml, Config, EnrichmentCache, GeoSnapshot, PslSnapshot};
use zip::write::SimpleFileOptions;

const MAX_PROCESSING_TIME_MS: u128 = 2000;
const TEST_BOMB_SIZE: usize = 2 * 1024 * 1024;

fn test_config() -> Config {
    Config { offline: true, ..Config::default() }
}

fn offline_cache() -> EnrichmentCache {
    EnrichmentCache::new(None, Arc::new(GeoSnapshot::empty()), Arc::new(PslSnapshot::builtin()))
}

fn zip_bytes(name: &str, content: &[u8]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(&mut cursor);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    writer.start_file(name, options).unwrap();
    writer.write_all(content).unwrap();
    writer.finish().unwrap();
    cursor.into_inner()
}

/// ZIP bombs are stopped by the decompression limits before they expand.
#[test]
fn test_zip_bomb_protection() {
    let bomb = zip_bytes("large.xml", &vec![b'A'; TEST_BOMB_SIZE]);
    let mut config = test_config();
    config.max_decompressed_size = 1024 * 1024;

    let start = Instant::now();
    let result = extract::extract_zip_bytes(&bomb, &config);
    let duration = start.elapsed();
    assert!(
        duration.as_millis() < MAX_PROCESSING_TIME_MS,
        "ZIP bomb processing too slow: {:?}",
        duration
    );
    match result {
        Ok(files) => assert!(files.is_empty(), "ZIP bomb should be blocked"),
        Err(e) => assert!(
            e.to_string().contains("too large")
                || e.to_string().contains("Suspicious compression ratio"),
            "Unexpected error: {}",
            e
        ),
    }
}

/// External entity declarations are stripped before parsing.
#[test]
fn test_xxe_protection() {
    let xml = r#"
    <?xml version="1.0" encoding="UTF-8"?>
    <!DOCTYPE foo [
        <!ENTITY xxe SYSTEM "file:///etc/passwd">
    ]>
    <feedback>
        <record>
            <row>
                <source_ip>1.2.3.4</source_ip>
                <count>1</count>
            </row>
            <identifiers><header_from>example.com</header_from></identifiers>
        </record>
    </feedback>
    "#;
    let result = parse_aggregate_xml(xml, &mut offline_cache());
    assert!(result.is_ok(), "Parser should handle malicious XML safely");
    for record in result.unwrap().records {
        assert!(!record.source_ip.contains("/etc/passwd"), "XXE allowed system file read");
    }
}

/// Archive members addressing parent directories are rejected.
#[test]
fn test_directory_traversal_protection() {
    let evil = zip_bytes("../../../etc/passwd", b"fake passwd file");
    let result = extract::extract_zip_bytes(&evil, &test_config());
    assert!(result.is_err(), "Should block directory traversal attempt");
}

/// Recursive entity definitions are rejected outright.
#[test]
fn test_billion_laughs_protection() {
    let xml = r#"
    <?xml version="1.0"?>
    <!DOCTYPE lolz [
        <!ENTITY lol "lol">
        <!ENTITY lol2 "&lol;&lol;">
        <!ENTITY lol3 "&lol2;&lol2;">
        <!ENTITY lol4 "&lol3;&lol3;">
        <!ENTITY lol5 "&lol4;&lol4;">
    ]>
    <feedback>
        <record><row><source_ip>1.2.3.4</source_ip></row></record>
    </feedback>
    "#;
    let start = Instant::now();
    let result = parse_aggregate_xml(xml, &mut offline_cache());
    assert!(
        start.elapsed().as_millis() < MAX_PROCESSING_TIME_MS,
        "XML Billion Laughs was not blocked in time"
    );
    assert!(result.is_err(), "Parser should reject recursive entities");
}

fn aggregate_message(uid: u32, disposition: &str) -> RawMessage {
    let raw = format!(
        "From: noreply-dmarc@mail.example.com\r\n\
         Message-ID: <{uid}@mail.example.com>\r\n\
         Content-Type: text/xml\r\n\r\n\
         <feedback>\
           <report_metadata>\
             <org_name>mail.example.com</org_name>\
             <report_id>rid-{uid}</report_id>\
             <date_range><begin>1706745600</begin><end>1706831999</end></date_range>\
           </report_metadata>\
           <policy_published><domain>sender.example</domain><p>reject</p></policy_published>\
           <record><row>\
             <source_ip>203.0.113.{uid}</source_ip><count>3</count>\
             <policy_evaluated><disposition>{disposition}</disposition></policy_evaluated>\
           </row></record>\
         </feedback>\r\n"
    );
    RawMessage { uid, bytes: raw.into_bytes() }
}

fn poisoned_message(uid: u32) -> RawMessage {
    RawMessage {
        uid,
        bytes: format!(
            "From: x@example.com\r\nMessage-ID: <{uid}@x>\r\nContent-Type: text/xml\r\n\r\n\
             <feedback><record><row><source_ip>trunca"
        )
        .into_bytes(),
    }
}

/// End to end: a batch with one poisoned message still yields K terminal
/// outcomes and the reconciliation plan archives the K-1 good ones.
#[test]
fn test_batch_isolation_and_reconciliation_plan() {
    let messages = vec![
        aggregate_message(1, "none"),
        poisoned_message(2),
        aggregate_message(3, "pass"),
        aggregate_message(4, "quarantine"),
    ];
    let geo = Arc::new(GeoSnapshot::empty());
    let psl = Arc::new(PslSnapshot::builtin());
    let config = test_config();

    let outcomes = batch::run(&messages, &config, &geo, &psl);
    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes.iter().filter(|o| o.failed()).count(), 1);

    // Normalization holds across the pipeline: org FQDN reduced, every
    // disposition in the closed set.
    for outcome in &outcomes {
        for parsed in &outcome.outcomes {
            if let ParseOutcome::Aggregate(report) = parsed {
                assert_eq!(report.metadata.org_name, "example.com");
                for record in &report.records {
                    assert!(matches!(
                        record.policy_evaluated.disposition,
                        Disposition::None | Disposition::Quarantine | Disposition::Reject
                    ));
                }
            }
        }
    }

    let plan = plan_reconciliation(&outcomes, &config);
    assert_eq!(
        plan,
        vec![
            ReconcileAction::Archive(1),
            ReconcileAction::Quarantine(2),
            ReconcileAction::Archive(3),
            ReconcileAction::Archive(4),
        ]
    );
}

/// Parallel dispatch yields a result sequence identical in order and content
/// to sequential dispatch on the same batch.
#[test]
fn test_parallel_dispatch_parity() {
    let messages: Vec<RawMessage> = (1..=12)
        .map(|uid| if uid % 5 == 0 { poisoned_message(uid) } else { aggregate_message(uid, "pass") })
        .collect();
    let geo = Arc::new(GeoSnapshot::empty());
    let psl = Arc::new(PslSnapshot::builtin());

    let sequential = batch::run(&messages, &test_config(), &geo, &psl);
    let mut parallel_config = test_config();
    parallel_config.workers = 4;
    let parallel = batch::run(&messages, &parallel_config, &geo, &psl);

    assert_eq!(sequential, parallel);
}

//! Enrichment Cache Module
//!
//! This module memoizes reverse-DNS, geolocation-country, and
//! organizational-domain lookups for the lifetime of one process. Results are
//! cached to reduce redundant lookups and improve performance; negative
//! results are cached too, so a timed-out or missing PTR record is queried at
//! most once per IP per run. Lookup failures degrade to null-valued fields
//! and never abort report processing.

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::geo::GeoSnapshot;
use crate::psl::PslSnapshot;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::Resolver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Network-identity context attached to a source IP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IpEnrichment {
    pub reverse_dns: Option<String>,
    pub country: Option<String>,
}

/// Seam for the reverse-DNS collaborator so tests can observe query counts.
pub trait ReverseDns: Send {
    fn reverse_lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Production resolver backed by hickory with an explicit timeout and an
/// optional nameserver list.
pub struct DnsReverseResolver {
    resolver: Resolver,
}

impl DnsReverseResolver {
    pub fn new(nameservers: &[IpAddr], timeout: Duration) -> Result<Self> {
        let config = if nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            ResolverConfig::from_parts(
                None,
                vec![],
                NameServerConfigGroup::from_ips_clear(nameservers, 53, true),
            )
        };
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        let resolver = Resolver::new(config, opts)
            .map_err(|e| IngestError::Enrichment(e.to_string()))?;
        Ok(DnsReverseResolver { resolver })
    }
}

impl ReverseDns for DnsReverseResolver {
    fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(ip) {
            Ok(response) => response
                .iter()
                .next()
                .map(|ptr| ptr.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                warn!("Reverse DNS lookup failed for IP {}: {}", ip, e);
                None
            }
        }
    }
}

/// Process-scoped lookup cache. Each parse worker owns exactly one instance;
/// nothing here is shared mutably, and entries never expire within a run.
pub struct EnrichmentCache {
    resolver: Option<Box<dyn ReverseDns>>,
    geo: Arc<GeoSnapshot>,
    psl: Arc<PslSnapshot>,
    dns_cache: HashMap<IpAddr, Option<String>>,
    geo_cache: HashMap<IpAddr, Option<String>>,
    domain_cache: HashMap<String, String>,
    dns_queries: usize,
}

impl EnrichmentCache {
    pub fn new(
        resolver: Option<Box<dyn ReverseDns>>,
        geo: Arc<GeoSnapshot>,
        psl: Arc<PslSnapshot>,
    ) -> Self {
        EnrichmentCache {
            resolver,
            geo,
            psl,
            dns_cache: HashMap::new(),
            geo_cache: HashMap::new(),
            domain_cache: HashMap::new(),
            dns_queries: 0,
        }
    }

    /// Builds a cache from runtime configuration: offline mode gets no
    /// resolver, and a resolver that cannot be constructed degrades to
    /// offline rather than failing the run.
    pub fn from_config(config: &Config, geo: Arc<GeoSnapshot>, psl: Arc<PslSnapshot>) -> Self {
        let resolver: Option<Box<dyn ReverseDns>> = if config.offline {
            None
        } else {
            match DnsReverseResolver::new(
                &config.nameservers,
                Duration::from_secs(config.dns_timeout_secs),
            ) {
                Ok(resolver) => Some(Box::new(resolver)),
                Err(e) => {
                    warn!("DNS resolver unavailable, continuing offline: {}", e);
                    None
                }
            }
        };
        Self::new(resolver, geo, psl)
    }

    /// Looks up reverse DNS and country for the given IP address. First
    /// checks the caches; each underlying source is queried at most once per
    /// distinct IP, misses included.
    pub fn resolve_ip(&mut self, ip_str: &str) -> IpEnrichment {
        let ip: IpAddr = match ip_str.trim().parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!("Unparseable source IP: {:?}", ip_str);
                return IpEnrichment::default();
            }
        };

        let reverse_dns = match self.dns_cache.get(&ip) {
            Some(cached) => cached.clone(),
            None => {
                let resolved = match self.resolver.as_ref() {
                    Some(resolver) => {
                        self.dns_queries += 1;
                        resolver.reverse_lookup(ip)
                    }
                    None => None,
                };
                if resolved.is_some() {
                    info!("Resolved reverse DNS for IP: {}", ip);
                }
                self.dns_cache.insert(ip, resolved.clone());
                resolved
            }
        };

        let country = match self.geo_cache.get(&ip) {
            Some(cached) => cached.clone(),
            None => {
                let found = self.geo.country(ip);
                self.geo_cache.insert(ip, found.clone());
                found
            }
        };

        IpEnrichment { reverse_dns, country }
    }

    /// Reduces a domain to its organizational domain, memoized.
    pub fn organizational_domain(&mut self, domain: &str) -> String {
        let key = domain.trim().to_lowercase();
        if let Some(cached) = self.domain_cache.get(&key) {
            return cached.clone();
        }
        let reduced = self.psl.organizational_domain(&key);
        self.domain_cache.insert(key, reduced.clone());
        reduced
    }

    /// Number of reverse-DNS queries actually issued to the resolver.
    pub fn dns_queries(&self) -> usize {
        self.dns_queries
    }

    pub fn cache_size(&self) -> usize {
        self.dns_cache.len() + self.geo_cache.len() + self.domain_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: Arc<AtomicUsize>,
        answer: Option<String>,
    }

    impl ReverseDns for CountingResolver {
        fn reverse_lookup(&self, _ip: IpAddr) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn cache_with(answer: Option<String>) -> (EnrichmentCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = CountingResolver { calls: calls.clone(), answer };
        let cache = EnrichmentCache::new(
            Some(Box::new(resolver)),
            Arc::new(GeoSnapshot::empty()),
            Arc::new(PslSnapshot::builtin()),
        );
        (cache, calls)
    }

    #[test]
    fn test_one_dns_query_per_distinct_ip() {
        let (mut cache, calls) = cache_with(Some("mail.example.com".to_string()));
        for _ in 0..5 {
            let result = cache.resolve_ip("203.0.113.5");
            assert_eq!(result.reverse_dns.as_deref(), Some("mail.example.com"));
        }
        cache.resolve_ip("203.0.113.6");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.dns_queries(), 2);
    }

    #[test]
    fn test_negative_results_are_cached() {
        let (mut cache, calls) = cache_with(None);
        for _ in 0..3 {
            let result = cache.resolve_ip("203.0.113.5");
            assert_eq!(result.reverse_dns, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bad_ip_degrades_to_null_fields() {
        let (mut cache, calls) = cache_with(Some("x".to_string()));
        assert_eq!(cache.resolve_ip("not-an-ip"), IpEnrichment::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_offline_cache_never_queries() {
        let mut cache = EnrichmentCache::new(
            None,
            Arc::new(GeoSnapshot::empty()),
            Arc::new(PslSnapshot::builtin()),
        );
        let result = cache.resolve_ip("203.0.113.5");
        assert_eq!(result.reverse_dns, None);
        assert_eq!(cache.dns_queries(), 0);
    }

    #[test]
    fn test_organizational_domain_memoized() {
        let mut cache = EnrichmentCache::new(
            None,
            Arc::new(GeoSnapshot::empty()),
            Arc::new(PslSnapshot::builtin()),
        );
        assert_eq!(cache.organizational_domain("mail.example.com"), "example.com");
        assert_eq!(cache.organizational_domain("MAIL.EXAMPLE.COM"), "example.com");
        assert_eq!(cache.cache_size(), 1);
    }
}

//! Public Suffix Snapshot Module
//!
//! This module reduces hostnames to their organizational (registrable)
//! domain using public-suffix rules loaded from a local snapshot file in the
//! standard list format. The snapshot is an immutable value constructed up
//! front; refreshing the rules means loading a new snapshot, never mutating
//! one that lookups may be reading.

use crate::error::Result;
use std::collections::HashSet;
use std::path::Path;

/// A modest built-in rule set used when no snapshot file is configured.
const BUILTIN_RULES: &str = "\
com\nnet\norg\nedu\ngov\nmil\nint\ninfo\nbiz\nio\ndev\napp\nme\n\
co.uk\norg.uk\nac.uk\ngov.uk\nco.jp\nne.jp\nor.jp\ncom.au\nnet.au\norg.au\n\
co.nz\nde\nfr\nnl\nit\nes\npl\nse\nno\nfi\ndk\ncz\nat\nch\nbe\neu\nca\n\
com.br\nnet.br\norg.br\nco.in\nru\ncn\ncom.cn\nnet.cn\n";

#[derive(Debug, Clone, Default)]
pub struct PslSnapshot {
    rules: HashSet<String>,
    wildcards: HashSet<String>,
    exceptions: HashSet<String>,
}

impl PslSnapshot {
    /// Loads rules from a snapshot file in the public suffix list format:
    /// one rule per line, `//` comments, `*.` wildcard rules, `!` exceptions.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(Self::from_rules(&data))
    }

    /// Builds the snapshot from the built-in fallback rule set.
    pub fn builtin() -> Self {
        Self::from_rules(BUILTIN_RULES)
    }

    pub fn from_rules(data: &str) -> Self {
        let mut snapshot = PslSnapshot::default();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let rule = line.split_whitespace().next().unwrap_or("").to_lowercase();
            if let Some(rest) = rule.strip_prefix("!") {
                snapshot.exceptions.insert(rest.to_string());
            } else if let Some(rest) = rule.strip_prefix("*.") {
                snapshot.wildcards.insert(rest.to_string());
            } else {
                snapshot.rules.insert(rule);
            }
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.rules.len() + self.wildcards.len() + self.exceptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reduces a hostname to its registrable domain, e.g.
    /// `mail.example.com` -> `example.com`. Inputs that are already a bare
    /// public suffix, or that match no rule at all, fall back to their last
    /// two labels.
    pub fn organizational_domain(&self, domain: &str) -> String {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
        if labels.len() < 2 {
            return domain;
        }

        // Walk suffix candidates from longest to shortest; the first rule hit
        // decides the registrable boundary.
        for start in 0..labels.len() {
            let candidate = labels[start..].join(".");
            if self.exceptions.contains(&candidate) {
                // Exception rules are themselves registrable.
                return candidate;
            }
            // `*.base` marks every `<label>.base` as a public suffix.
            let is_wildcard_match = start + 1 < labels.len()
                && self.wildcards.contains(&labels[start + 1..].join("."));
            if self.rules.contains(&candidate) || is_wildcard_match {
                if start == 0 {
                    // The whole input is a public suffix; nothing to reduce.
                    return domain;
                }
                return labels[start - 1..].join(".");
            }
        }

        labels[labels.len() - 2..].join(".")
    }
}

//! Recipient validation and deduplication.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use validator::ValidateEmail;

/// Why an address was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    MalformedAddress,
    DisallowedDomain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecipient {
    pub address: String,
    pub reason: RejectionReason,
}

/// Result of validating a recipient list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientReport {
    /// Valid, deduplicated addresses in input order.
    pub valid: Vec<String>,
    pub rejected: Vec<RejectedRecipient>,
    /// Addresses dropped as case-insensitive repeats of an earlier entry.
    pub duplicates: usize,
}

/// Address syntax check plus an optional domain denylist.
#[derive(Debug, Clone, Default)]
pub struct RecipientValidator {
    denied_domains: Vec<String>,
}

impl RecipientValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject addresses in these domains and their subdomains.
    pub fn with_denied_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.denied_domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('@').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        self
    }

    /// Trim, validate and dedup `addresses`. The first spelling of a repeated address wins.
    pub fn validate<S: AsRef<str>>(&self, addresses: &[S]) -> RecipientReport {
        let mut report = RecipientReport::default();
        let mut seen = HashSet::new();

        for raw in addresses {
            let address = raw.as_ref().trim();

            if !address.validate_email() {
                report.rejected.push(RejectedRecipient {
                    address: address.to_string(),
                    reason: RejectionReason::MalformedAddress,
                });
                continue;
            }

            if self.is_denied(address) {
                report.rejected.push(RejectedRecipient {
                    address: address.to_string(),
                    reason: RejectionReason::DisallowedDomain,
                });
                continue;
            }

            if seen.insert(address.to_lowercase()) {
                report.valid.push(address.to_string());
            } else {
                report.duplicates += 1;
            }
        }

        report
    }

    fn is_denied(&self, address: &str) -> bool {
        let Some((_, domain)) = address.rsplit_once('@') else {
            return false;
        };
        let domain = domain.to_ascii_lowercase();
        self.denied_domains.iter().any(|denied| {
            domain == *denied
                || domain
                    .strip_suffix(denied.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

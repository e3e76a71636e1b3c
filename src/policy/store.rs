//! Concurrent rule storage.
//!
//! Rules are mutated by the command surface while every in-flight query reads
//! them. Each rule set is a sharded concurrent map, so a reader only ever
//! waits on the shard a writer is touching and never sees a half-written
//! entry.

use std::net::IpAddr;

use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::config::{DomainMatch, PolicySettings};
use crate::error::PolicyError;

/// Normalize a domain for comparison: lowercase, no trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}

/// Process-lifetime block rules.
#[derive(Debug, Default)]
pub struct PolicyStore {
    /// Application identity to blocked flag. `false` entries are kept as
    /// explicit allows.
    apps: DashMap<String, bool>,
    /// Normalized domain rules.
    domains: DashSet<String>,
    addresses: DashSet<IpAddr>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding the initial rules from configuration.
    pub fn from_settings(settings: &PolicySettings) -> Self {
        let store = Self::new();
        for app in &settings.blocked_apps {
            store.apps.insert(app.trim().to_string(), true);
        }
        for domain in &settings.blocked_domains {
            store.domains.insert(normalize_domain(domain));
        }
        for address in &settings.blocked_addresses {
            store.addresses.insert(*address);
        }
        store
    }

    /// Set the rule for an application identity.
    pub fn set_app_rule(&self, package: &str, blocked: bool) -> Result<(), PolicyError> {
        let package = package.trim();
        if package.is_empty() {
            return Err(PolicyError::EmptyRule);
        }
        debug!(package, blocked, "app rule updated");
        self.apps.insert(package.to_string(), blocked);
        Ok(())
    }

    /// Add (`blocked = true`) or remove a domain rule.
    pub fn set_domain_rule(&self, domain: &str, blocked: bool) -> Result<(), PolicyError> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Err(PolicyError::EmptyRule);
        }
        debug!(%domain, blocked, "domain rule updated");
        if blocked {
            self.domains.insert(domain);
        } else {
            self.domains.remove(&domain);
        }
        Ok(())
    }

    /// Add (`blocked = true`) or remove an address rule.
    pub fn set_ip_rule(&self, address: &str, blocked: bool) -> Result<(), PolicyError> {
        let value = address.trim();
        if value.is_empty() {
            return Err(PolicyError::EmptyRule);
        }
        let ip: IpAddr = value.parse().map_err(|source| PolicyError::InvalidAddress {
            value: value.to_string(),
            source,
        })?;
        debug!(%ip, blocked, "address rule updated");
        if blocked {
            self.addresses.insert(ip);
        } else {
            self.addresses.remove(&ip);
        }
        Ok(())
    }

    /// Current rule for an application, if one was ever set.
    pub fn app_rule(&self, package: &str) -> Option<bool> {
        self.apps.get(package).map(|entry| *entry.value())
    }

    pub fn is_app_blocked(&self, package: &str) -> bool {
        self.app_rule(package).unwrap_or(false)
    }

    /// Find the domain rule matching `name`.
    ///
    /// `name` must already be normalized. When several rules match, the
    /// longest one is returned.
    pub fn matching_domain_rule(&self, name: &str, mode: DomainMatch) -> Option<String> {
        self.domains
            .iter()
            .filter(|rule| domain_matches(name, rule.key(), mode))
            .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| b.key().cmp(a.key())))
            .map(|rule| rule.key().clone())
    }

    /// First of `addresses` covered by an address rule.
    pub fn blocked_address(&self, addresses: &[IpAddr]) -> Option<IpAddr> {
        addresses
            .iter()
            .copied()
            .find(|ip| self.addresses.contains(ip))
    }

    pub fn has_address_rules(&self) -> bool {
        !self.addresses.is_empty()
    }

    pub fn app_rule_count(&self) -> usize {
        self.apps.len()
    }

    pub fn domain_rule_count(&self) -> usize {
        self.domains.len()
    }

    pub fn address_rule_count(&self) -> usize {
        self.addresses.len()
    }
}

/// Whether a normalized `name` is covered by a normalized `rule`.
pub fn domain_matches(name: &str, rule: &str, mode: DomainMatch) -> bool {
    match mode {
        DomainMatch::Substring => name.contains(rule),
        DomainMatch::LabelSuffix => {
            name == rule
                || name
                    .strip_suffix(rule)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        }
    }
}

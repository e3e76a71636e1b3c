//! Block/allow decisions for intercepted queries.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::DomainMatch;
use crate::network::UdpDatagram;
use crate::network::checksum::UDP_PROTOCOL;
use crate::platform::AppResolver;

use super::store::{PolicyStore, normalize_domain};

/// Why a query was blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The owning application is blocked.
    App(String),
    /// The queried name matched this domain rule.
    Domain(String),
    /// The upstream answer resolved to a blocked address.
    Address(IpAddr),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::App(package) => write!(f, "application rule: {package}"),
            Self::Domain(rule) => write!(f, "domain rule: {rule}"),
            Self::Address(ip) => write!(f, "address rule: {ip}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block(BlockReason),
}

impl Verdict {
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Block(_))
    }
}

/// Outcome of evaluating one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Application owning the flow, when the host could tell.
    pub app: Option<String>,
    pub verdict: Verdict,
}

/// Evaluates queries against a shared [`PolicyStore`].
///
/// Order is fixed: the application rule first, then domain rules. Address
/// rules only apply to answers, through [`PolicyEvaluator::check_response`].
pub struct PolicyEvaluator<A> {
    store: Arc<PolicyStore>,
    apps: Arc<A>,
    domain_match: DomainMatch,
}

impl<A> Clone for PolicyEvaluator<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            apps: Arc::clone(&self.apps),
            domain_match: self.domain_match,
        }
    }
}

impl<A: AppResolver> PolicyEvaluator<A> {
    pub fn new(store: Arc<PolicyStore>, apps: Arc<A>, domain_match: DomainMatch) -> Self {
        Self {
            store,
            apps,
            domain_match,
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Decide whether `query`, asking for `domain`, may be forwarded.
    pub fn evaluate(&self, query: &UdpDatagram, domain: Option<&str>) -> Evaluation {
        let app = self.apps.owning_application(
            UDP_PROTOCOL,
            query.source(),
            query.destination(),
        );

        if let Some(package) = &app
            && self.store.is_app_blocked(package)
        {
            return Evaluation {
                verdict: Verdict::Block(BlockReason::App(package.clone())),
                app,
            };
        }

        let verdict = domain
            .map(normalize_domain)
            .and_then(|name| self.store.matching_domain_rule(&name, self.domain_match))
            .map_or(Verdict::Allow, |rule| {
                Verdict::Block(BlockReason::Domain(rule))
            });

        Evaluation { app, verdict }
    }

    /// Decide whether an answer resolving to `addresses` may be delivered.
    pub fn check_response(&self, addresses: &[IpAddr]) -> Verdict {
        self.store
            .blocked_address(addresses)
            .map_or(Verdict::Allow, |ip| Verdict::Block(BlockReason::Address(ip)))
    }

    /// Whether answers need inspecting at all.
    pub fn inspects_responses(&self) -> bool {
        self.store.has_address_rules()
    }
}

//! DNS resolver trait and implementations.
//!
//! Provides abstraction over DNS resolution to enable:
//! - Testing with mock resolvers
//! - Forwarding over sockets that bypass the tunnel

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::UpstreamSettings;
use crate::error::{Result, UpstreamError};
use crate::platform::NetworkBypass;

/// Trait for DNS resolution.
///
/// Queries and responses are raw DNS messages: the payload received from the
/// tunnel goes out verbatim and the upstream's answer comes back untouched.
pub trait DnsResolver: Send + Sync + Clone + 'static {
    /// Resolve a DNS query and return the raw response.
    fn resolve(&self, query: &[u8]) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Upstream resolver with ordered fallback.
///
/// For every query it asks the resolvers of the underlying network first,
/// then the configured public fallbacks, one at a time, each attempt bounded
/// by the response timeout. The first answer wins.
pub struct UpstreamResolver<B> {
    bypass: Arc<B>,
    fallback: Arc<[IpAddr]>,
    port: u16,
    timeout: Duration,
    max_response_size: usize,
}

impl<B> Clone for UpstreamResolver<B> {
    fn clone(&self) -> Self {
        Self {
            bypass: Arc::clone(&self.bypass),
            fallback: Arc::clone(&self.fallback),
            port: self.port,
            timeout: self.timeout,
            max_response_size: self.max_response_size,
        }
    }
}

impl<B: NetworkBypass> UpstreamResolver<B> {
    /// Create a new upstream resolver.
    pub fn new(bypass: Arc<B>, settings: &UpstreamSettings) -> Self {
        Self {
            bypass,
            fallback: settings.fallback.clone().into(),
            port: settings.port,
            timeout: settings.timeout(),
            max_response_size: settings.max_response_size,
        }
    }

    /// Per-attempt response timeout.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the ordered, de-duplicated list of servers to try: the
    /// underlying network's resolvers in discovery order, then the fallbacks.
    pub fn candidates(&self, network: Option<&B::Network>) -> Vec<IpAddr> {
        let system = network
            .map(|network| self.bypass.dns_servers(network))
            .unwrap_or_default();

        let system = system.iter().filter_map(|server| {
            let server = server.trim().trim_start_matches('/');
            match server.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    debug!(server, "ignoring unparsable system DNS server");
                    None
                }
            }
        });

        let mut seen = HashSet::new();
        system
            .chain(self.fallback.iter().copied())
            .filter(|ip| seen.insert(*ip))
            .collect()
    }

    /// One exchange with one server over a fresh socket.
    async fn attempt(
        &self,
        server: IpAddr,
        network: Option<&B::Network>,
        query: &[u8],
    ) -> Result<Vec<u8>> {
        let local: SocketAddr = match server {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;

        let bound = network.is_some_and(|network| self.bypass.bind_to_network(&socket, network));
        if !bound && !self.bypass.protect(&socket) {
            return Err(UpstreamError::Bypass(server).into());
        }

        socket.connect((server, self.port)).await?;
        socket.send(query).await?;

        let mut response = vec![0u8; self.max_response_size];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| UpstreamError::Timeout(server))??;
        response.truncate(len);
        Ok(response)
    }
}

impl<B: NetworkBypass> DnsResolver for UpstreamResolver<B> {
    async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>> {
        let network = self.bypass.discover_network();
        let candidates = self.candidates(network.as_ref());

        for server in &candidates {
            match self.attempt(*server, network.as_ref(), query).await {
                Ok(response) => {
                    debug!(%server, "upstream answered");
                    metrics::counter!("sentinel_upstream_attempts_total", "result" => "ok")
                        .increment(1);
                    return Ok(response);
                }
                Err(err) => {
                    debug!(%server, "upstream attempt failed: {err}");
                    metrics::counter!("sentinel_upstream_attempts_total", "result" => "failed")
                        .increment(1);
                }
            }
        }

        warn!(attempts = candidates.len(), "all upstreams failed");
        Err(UpstreamError::Exhausted {
            attempts: candidates.len(),
        }
        .into())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::dns::name::extract_qname;
    use crate::error::Error;
    use crate::platform::tests::MockHost;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    /// Mock resolver for testing.
    ///
    /// Allows pre-configuring responses and tracking resolve calls. Unknown
    /// names are answered by echoing the query with the response bit set.
    #[derive(Clone, Default)]
    pub struct MockResolver {
        /// Pre-configured responses by domain name.
        pub responses: Arc<parking_lot::Mutex<HashMap<String, Vec<u8>>>>,
        /// Count of resolve calls.
        pub resolve_count: Arc<AtomicU64>,
        /// If set, resolve fails.
        pub fail: Arc<std::sync::atomic::AtomicBool>,
        /// Delay before answering.
        pub delay: Arc<parking_lot::Mutex<Option<Duration>>>,
    }

    impl MockResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_response(&self, domain: &str, response: Vec<u8>) {
            self.responses.lock().insert(domain.to_string(), response);
        }

        pub fn set_error(&self) {
            self.fail.store(true, Ordering::SeqCst);
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = Some(delay);
        }

        pub fn resolve_count(&self) -> u64 {
            self.resolve_count.load(Ordering::SeqCst)
        }
    }

    impl DnsResolver for MockResolver {
        async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>> {
            self.resolve_count.fetch_add(1, Ordering::SeqCst);

            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Upstream(UpstreamError::Exhausted { attempts: 0 }));
            }

            if let Some(name) = extract_qname(query)
                && let Some(response) = self.responses.lock().get(&name)
            {
                let mut response = response.clone();
                // Match query ID
                response[..2].copy_from_slice(&query[..2]);
                return Ok(response);
            }

            let mut response = query.to_vec();
            if let Some(flags) = response.get_mut(2) {
                *flags |= 0x80;
            }
            Ok(response)
        }
    }

    fn settings(fallback: &[IpAddr], port: u16, timeout: Duration) -> UpstreamSettings {
        UpstreamSettings {
            fallback: fallback.to_vec(),
            port,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap(),
            max_response_size: 4096,
        }
    }

    fn loopback(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, last))
    }

    #[test]
    fn should_default_to_two_second_timeout() {
        let resolver = UpstreamResolver::new(Arc::new(MockHost::new()), &UpstreamSettings::default());
        assert_eq!(resolver.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn should_list_fallbacks_when_no_network_is_known() {
        let resolver = UpstreamResolver::new(Arc::new(MockHost::new()), &UpstreamSettings::default());
        let candidates: Vec<String> = resolver
            .candidates(None)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(candidates, ["1.1.1.1", "2606:4700:4700::1111", "8.8.8.8"]);
    }

    #[test]
    fn should_put_system_servers_first_and_deduplicate() {
        let host = MockHost::new().with_network(
            "wlan0",
            &["/192.168.1.1", "8.8.8.8", "192.168.1.1", "fe80::1%wlan0", ""],
        );
        let resolver = UpstreamResolver::new(Arc::new(host.clone()), &UpstreamSettings::default());

        let network = host.discover_network();
        let candidates: Vec<String> = resolver
            .candidates(network.as_ref())
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            candidates,
            ["192.168.1.1", "8.8.8.8", "1.1.1.1", "2606:4700:4700::1111"]
        );
    }

    #[tokio::test]
    async fn should_fall_back_until_a_server_answers() {
        let silent_a = UdpSocket::bind((loopback(1), 0)).await.unwrap();
        let port = silent_a.local_addr().unwrap().port();
        let silent_b = UdpSocket::bind((loopback(2), port)).await.unwrap();
        let responder = UdpSocket::bind((loopback(3), port)).await.unwrap();

        let answering = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = responder.recv_from(&mut buf).await.unwrap();
            let mut reply = buf[..len].to_vec();
            reply.extend_from_slice(b"-answer");
            responder.send_to(&reply, peer).await.unwrap();
        });

        let host = MockHost::new();
        let timeout = Duration::from_millis(200);
        let resolver = UpstreamResolver::new(
            Arc::new(host.clone()),
            &settings(&[loopback(1), loopback(2), loopback(3)], port, timeout),
        );

        let started = Instant::now();
        let response = resolver.resolve(b"query").await.unwrap();

        assert_eq!(response, b"query-answer");
        assert!(started.elapsed() >= timeout * 2);
        answering.await.unwrap();

        // Exactly one attempt reached each silent server.
        let mut buf = [0u8; 64];
        for silent in [&silent_a, &silent_b] {
            let (len, _) = silent.try_recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..len], b"query");
            assert!(silent.try_recv_from(&mut buf).is_err());
        }
        assert_eq!(host.protect_count(), 3);
        assert_eq!(host.bind_count(), 0);
    }

    #[tokio::test]
    async fn should_report_exhaustion_when_every_server_times_out() {
        let silent = UdpSocket::bind((loopback(1), 0)).await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let resolver = UpstreamResolver::new(
            Arc::new(MockHost::new()),
            &settings(&[loopback(1)], port, Duration::from_millis(50)),
        );

        let err = resolver.resolve(b"query").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Upstream(UpstreamError::Exhausted { attempts: 1 })
        ));
    }

    #[tokio::test]
    async fn should_skip_candidates_that_cannot_bypass_the_tunnel() {
        let host = MockHost::new();
        host.protect_result.store(false, Ordering::SeqCst);

        let resolver = UpstreamResolver::new(
            Arc::new(host.clone()),
            &settings(&[loopback(1), loopback(2)], 53, Duration::from_millis(50)),
        );

        let err = resolver.resolve(b"query").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Upstream(UpstreamError::Exhausted { attempts: 2 })
        ));
        assert_eq!(host.protect_count(), 2);
    }

    #[tokio::test]
    async fn should_prefer_binding_to_underlying_network() {
        let responder = UdpSocket::bind((loopback(1), 0)).await.unwrap();
        let port = responder.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = responder.recv_from(&mut buf).await.unwrap();
            responder.send_to(&buf[..len], peer).await.unwrap();
        });

        let host = MockHost::new().with_network("eth0", &[]);
        let resolver = UpstreamResolver::new(
            Arc::new(host.clone()),
            &settings(&[loopback(1)], port, Duration::from_millis(500)),
        );

        assert_eq!(resolver.resolve(b"ping").await.unwrap(), b"ping");
        assert_eq!(host.bind_count(), 1);
        assert_eq!(host.protect_count(), 0);
    }

    #[tokio::test]
    async fn should_protect_when_binding_fails() {
        let host = MockHost::new().with_network("eth0", &[]);
        host.bind_result.store(false, Ordering::SeqCst);
        host.protect_result.store(false, Ordering::SeqCst);

        let resolver = UpstreamResolver::new(
            Arc::new(host.clone()),
            &settings(&[loopback(1)], 53, Duration::from_millis(50)),
        );

        assert!(resolver.resolve(b"ping").await.is_err());
        assert_eq!(host.bind_count(), 1);
        assert_eq!(host.protect_count(), 1);
    }
}

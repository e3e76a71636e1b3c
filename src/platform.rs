//! Capabilities the host platform provides to the engine.
//!
//! The engine never touches routing tables, socket marks or process tables
//! itself. Whatever runs it supplies one value implementing the traits below
//! (see [`HostPlatform`]); tests supply mocks.

use std::fmt;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

pub use crate::network::tunnel::TunnelProvider;

/// Keeps upstream traffic from being routed back into the tunnel.
pub trait NetworkBypass: Send + Sync + 'static {
    /// Handle on an underlying (non-tunnel) network.
    type Network: Clone + Send + Sync + fmt::Debug;

    /// Find an underlying network with Internet access, if any.
    fn discover_network(&self) -> Option<Self::Network>;

    /// Resolvers the underlying network advertises, in discovery order.
    ///
    /// Entries are textual addresses as the host reports them and may carry
    /// noise such as a leading `/`.
    fn dns_servers(&self, network: &Self::Network) -> Vec<String>;

    /// Bind `socket` to `network` so its traffic skips the tunnel.
    fn bind_to_network(&self, socket: &UdpSocket, network: &Self::Network) -> bool;

    /// Exclude `socket` from the tunnel without choosing a network.
    fn protect(&self, socket: &UdpSocket) -> bool;
}

/// Maps a flow to the application that owns it.
pub trait AppResolver: Send + Sync + 'static {
    /// Identity (e.g. package name) of the application owning the flow from
    /// `local` to `remote` over IP protocol `protocol`, if it can be told.
    fn owning_application(
        &self,
        protocol: u8,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Option<String>;
}

/// For hosts that cannot attribute flows to applications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAppResolver;

impl AppResolver for NoAppResolver {
    fn owning_application(&self, _: u8, _: SocketAddr, _: SocketAddr) -> Option<String> {
        None
    }
}

/// Everything the engine needs from its host.
pub trait HostPlatform: TunnelProvider + NetworkBypass + AppResolver {}

impl<T> HostPlatform for T where T: TunnelProvider + NetworkBypass + AppResolver {}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::error::{NetworkError, Result};
    use crate::network::tunnel::tests::{MockReader, MockWriter};
    use crate::network::{Tunnel, TunnelConfig};

    /// Mock host for testing.
    ///
    /// Every `establish` hands out a fresh mock tunnel; the feeding end of the
    /// most recent one is kept so tests can inject frames or close it.
    #[derive(Clone, Default)]
    pub struct MockHost {
        pub network: Arc<parking_lot::Mutex<Option<&'static str>>>,
        pub system_dns: Arc<parking_lot::Mutex<Vec<String>>>,
        pub bind_result: Arc<AtomicBool>,
        pub protect_result: Arc<AtomicBool>,
        pub bind_count: Arc<AtomicUsize>,
        pub protect_count: Arc<AtomicUsize>,
        pub apps: Arc<parking_lot::Mutex<HashMap<SocketAddr, String>>>,
        pub fail_establish: Arc<AtomicBool>,
        pub establish_count: Arc<AtomicUsize>,
        pub frames: Arc<parking_lot::Mutex<Option<tokio::sync::mpsc::UnboundedSender<std::io::Result<Vec<u8>>>>>>,
        pub writer: MockWriter,
    }

    impl MockHost {
        pub fn new() -> Self {
            let host = Self::default();
            host.bind_result.store(true, Ordering::SeqCst);
            host.protect_result.store(true, Ordering::SeqCst);
            host
        }

        pub fn with_network(self, name: &'static str, dns: &[&str]) -> Self {
            *self.network.lock() = Some(name);
            *self.system_dns.lock() = dns.iter().map(ToString::to_string).collect();
            self
        }

        pub fn with_app(self, local: SocketAddr, package: &str) -> Self {
            self.apps.lock().insert(local, package.to_string());
            self
        }

        pub fn protect_count(&self) -> usize {
            self.protect_count.load(Ordering::SeqCst)
        }

        pub fn bind_count(&self) -> usize {
            self.bind_count.load(Ordering::SeqCst)
        }

        /// Inject a frame into the current tunnel.
        pub fn push_frame(&self, frame: Vec<u8>) -> bool {
            self.frames
                .lock()
                .as_ref()
                .is_some_and(|tx| tx.send(Ok(frame)).is_ok())
        }

        /// Make the current tunnel's next read fail.
        pub fn fail_read(&self) {
            if let Some(tx) = self.frames.lock().as_ref() {
                let _ = tx.send(Err(std::io::Error::other("tunnel revoked")));
            }
        }

        /// Whether the engine still holds the current tunnel open.
        pub fn tunnel_open(&self) -> bool {
            self.frames.lock().as_ref().is_some_and(|tx| !tx.is_closed())
        }
    }

    impl NetworkBypass for MockHost {
        type Network = &'static str;

        fn discover_network(&self) -> Option<Self::Network> {
            *self.network.lock()
        }

        fn dns_servers(&self, _network: &Self::Network) -> Vec<String> {
            self.system_dns.lock().clone()
        }

        fn bind_to_network(&self, _socket: &UdpSocket, _network: &Self::Network) -> bool {
            self.bind_count.fetch_add(1, Ordering::SeqCst);
            self.bind_result.load(Ordering::SeqCst)
        }

        fn protect(&self, _socket: &UdpSocket) -> bool {
            self.protect_count.fetch_add(1, Ordering::SeqCst);
            self.protect_result.load(Ordering::SeqCst)
        }
    }

    impl AppResolver for MockHost {
        fn owning_application(
            &self,
            _protocol: u8,
            local: SocketAddr,
            _remote: SocketAddr,
        ) -> Option<String> {
            self.apps.lock().get(&local).cloned()
        }
    }

    impl TunnelProvider for MockHost {
        type Reader = MockReader;
        type Writer = MockWriter;

        async fn establish(&self, _config: &TunnelConfig) -> Result<Tunnel<MockReader, MockWriter>> {
            self.establish_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_establish.load(Ordering::SeqCst) {
                return Err(NetworkError::TunnelEstablish("permission denied".into()).into());
            }
            let (tx, reader) = MockReader::channel();
            *self.frames.lock() = Some(tx);
            Ok(Tunnel {
                reader,
                writer: self.writer.clone(),
            })
        }
    }

    #[test]
    fn should_never_resolve_app_without_capability() {
        let local: SocketAddr = "10.1.10.1:40000".parse().unwrap();
        let remote: SocketAddr = "8.8.8.8:53".parse().unwrap();
        assert!(NoAppResolver.owning_application(17, local, remote).is_none());
    }

    #[test]
    fn should_resolve_app_by_local_address() {
        let local: SocketAddr = "10.1.10.1:40000".parse().unwrap();
        let remote: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let host = MockHost::new().with_app(local, "com.example.app");

        assert_eq!(
            host.owning_application(17, local, remote).as_deref(),
            Some("com.example.app")
        );
        assert!(host.owning_application(17, remote, local).is_none());
    }
}

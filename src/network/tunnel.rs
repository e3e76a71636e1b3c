//! Tunnel I/O abstraction.
//!
//! The tunnel is a duplex stream of raw IP frames. Acquiring it is up to the
//! host platform ([`TunnelProvider`]); the engine only reads frames from one
//! half and writes synthesized frames to the other.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{Route, TunnelSettings};
use crate::error::Result;

/// Trait for the reading half of the tunnel.
pub trait TunnelReader: Send + 'static {
    /// Receive the next frame.
    /// Returns None once the tunnel has been closed.
    fn read_frame(&mut self) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;
}

/// Trait for the writing half of the tunnel.
pub trait TunnelWriter: Send + 'static {
    /// Write one complete frame.
    fn write_frame(&mut self, frame: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// What the host is asked to set up when the engine starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub name: String,
    pub ipv4_address: Ipv4Addr,
    pub ipv4_prefix: u8,
    pub ipv6_address: Ipv6Addr,
    pub ipv6_prefix: u8,
    /// Resolvers advertised to the device; they must be routed into the tunnel.
    pub dns_servers: Vec<IpAddr>,
    pub routes: Vec<Route>,
    pub mtu: u16,
}

impl From<&TunnelSettings> for TunnelConfig {
    fn from(settings: &TunnelSettings) -> Self {
        Self {
            name: settings.name.clone(),
            ipv4_address: settings.ipv4_address,
            ipv4_prefix: settings.ipv4_prefix,
            ipv6_address: settings.ipv6_address,
            ipv6_prefix: settings.ipv6_prefix,
            dns_servers: settings.dns_servers.clone(),
            routes: settings.routes.clone(),
            mtu: settings.mtu,
        }
    }
}

/// An established tunnel, split into its two halves.
pub struct Tunnel<R, W> {
    pub reader: R,
    pub writer: W,
}

/// Host capability that establishes the tunnel interface.
pub trait TunnelProvider: Send + Sync + 'static {
    type Reader: TunnelReader;
    type Writer: TunnelWriter;

    /// Create the interface, install its routes and return a handle to it.
    fn establish(
        &self,
        config: &TunnelConfig,
    ) -> impl Future<Output = Result<Tunnel<Self::Reader, Self::Writer>>> + Send;
}

/// Frame reader over any async byte source that preserves packet boundaries
/// on each read, such as a TUN file descriptor.
pub struct StreamReader<R> {
    inner: R,
    buffer: Vec<u8>,
}

impl<R> StreamReader<R> {
    /// Wrap `inner`, reading at most `max_frame` bytes at a time.
    pub fn new(inner: R, max_frame: usize) -> Self {
        Self {
            inner,
            buffer: vec![0u8; max_frame],
        }
    }
}

impl<R> TunnelReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let len = self.inner.read(&mut self.buffer).await?;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(self.buffer[..len].to_vec()))
    }
}

/// Frame writer over any async byte sink, one write per frame.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W> TunnelWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Mock tunnel reader fed through a channel.
    ///
    /// Dropping the sender closes the tunnel; sending an error makes the next
    /// read fail.
    pub struct MockReader {
        frames: mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
    }

    impl MockReader {
        pub fn channel() -> (mpsc::UnboundedSender<io::Result<Vec<u8>>>, Self) {
            let (tx, frames) = mpsc::unbounded_channel();
            (tx, Self { frames })
        }
    }

    impl TunnelReader for MockReader {
        async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
            self.frames.recv().await.transpose()
        }
    }

    /// Mock tunnel writer for testing.
    #[derive(Clone, Default)]
    pub struct MockWriter {
        pub written: Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
    }

    impl MockWriter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn written_count(&self) -> usize {
            self.written.lock().len()
        }

        pub fn last_written(&self) -> Option<Vec<u8>> {
            self.written.lock().last().cloned()
        }
    }

    impl TunnelWriter for MockWriter {
        async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            self.written.lock().push(frame.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mock_reader() {
        let (tx, mut reader) = MockReader::channel();
        tx.send(Ok(vec![1, 2, 3])).unwrap();
        tx.send(Err(io::Error::other("boom"))).unwrap();
        drop(tx);

        assert_eq!(reader.read_frame().await.unwrap(), Some(vec![1, 2, 3]));
        assert!(reader.read_frame().await.is_err());
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn should_read_one_frame_per_stream_read() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = StreamWriter::new(client);
        let mut reader = StreamReader::new(server, 1500);

        writer.write_frame(&[0x45, 0, 0, 20]).await.unwrap();
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(vec![0x45, 0, 0, 20])
        );

        drop(writer);
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }
}

//! TCP peer streams with UDP broadcast beacons.
//!
//! Stream wire format: [4-byte LE length][encoded frame]
//! Each accepted connection gets a reader task that forwards frames to the
//! listener's inbound channel until the peer hangs up or the node goes away.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use node_proto::MAX_FRAME_SIZE;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::discovery::{local_ipv4, Discovery};
use crate::transport::{Inbound, Listener, PeerStream, Transport};

const INBOUND_CAPACITY: usize = 1024;
const MAX_BEACON_SIZE: usize = 1024;
const RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct TcpTransport {
    bind: SocketAddr,
    interface: Option<Ipv4Addr>,
    /// `None` in gossip mode.
    beacon_port: Option<u16>,
    send_timeout: Duration,
    beacon_socket: OnceLock<Arc<UdpSocket>>,
}

impl TcpTransport {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.peer_port));
        let (bind, beacon_port) = match Discovery::from_config(config)? {
            Discovery::Beacon { port } => (any, Some(port)),
            Discovery::Gossip { bind, .. } => (bind.unwrap_or(any), None),
        };
        Ok(Self {
            bind,
            interface: config.interface_addr(),
            beacon_port,
            send_timeout: config.send_timeout(),
            beacon_socket: OnceLock::new(),
        })
    }

    fn advertised_host(&self) -> IpAddr {
        if !self.bind.ip().is_unspecified() {
            return self.bind.ip();
        }
        IpAddr::V4(self.interface.unwrap_or_else(local_ipv4))
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn listen(&self) -> Result<Listener> {
        let listener = TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("bind {}", self.bind))?;
        let port = listener.local_addr().context("listener address")?.port();
        let endpoint = SocketAddr::new(self.advertised_host(), port).to_string();

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut handle = Listener::new(endpoint.clone(), port, rx);
        handle.attach(tokio::spawn(accept_loop(listener, tx.clone())));

        if let Some(beacon_port) = self.beacon_port {
            let socket = Arc::new(beacon_socket(beacon_port)?);
            if self.beacon_socket.set(Arc::clone(&socket)).is_err() {
                bail!("transport is already listening");
            }
            handle.attach(tokio::spawn(beacon_loop(socket, tx)));
            info!("listening on {endpoint}, beacons on UDP {beacon_port}");
        } else {
            info!("listening on {endpoint}");
        }
        Ok(handle)
    }

    async fn broadcast(&self, frame: &[u8]) -> Result<()> {
        let (Some(socket), Some(port)) = (self.beacon_socket.get(), self.beacon_port) else {
            bail!("beacon socket is not open");
        };
        socket
            .send_to(frame, (Ipv4Addr::BROADCAST, port))
            .await
            .context("send beacon")?;
        Ok(())
    }

    async fn connect(&self, endpoint: &str) -> Result<Box<dyn PeerStream>> {
        let stream = tokio::time::timeout(self.send_timeout, TcpStream::connect(endpoint))
            .await
            .with_context(|| format!("connect to {endpoint} timed out"))?
            .with_context(|| format!("connect to {endpoint}"))?;
        stream.set_nodelay(true).ok();
        debug!("connected to {endpoint}");
        Ok(Box::new(TcpPeerStream {
            stream,
            endpoint: endpoint.to_string(),
            timeout: self.send_timeout,
        }))
    }
}

struct TcpPeerStream {
    stream: TcpStream,
    endpoint: String,
    timeout: Duration,
}

#[async_trait::async_trait]
impl PeerStream for TcpPeerStream {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        tokio::time::timeout(self.timeout, write_frame(&mut self.stream, frame))
            .await
            .with_context(|| format!("send to {} timed out", self.endpoint))?
    }
}

/// UDP socket shared by every node on this host.
fn beacon_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("create beacon socket")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("nonblocking")?;

    let addr: socket2::SockAddr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into();
    socket
        .bind(&addr)
        .with_context(|| format!("bind beacon port {port}"))?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("register beacon socket")
}

async fn beacon_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; MAX_BEACON_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let inbound = Inbound::Beacon {
                    host: from.ip().to_string(),
                    frame: buf[..len].to_vec(),
                };
                // A full queue drops the beacon; the next one will do.
                if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(inbound) {
                    break;
                }
            }
            Err(e) => {
                warn!("beacon receive failed: {e}");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Inbound>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };
        debug!("connection from {peer_addr}");
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {}
                result = read_stream(stream, peer_addr, &tx) => {
                    if let Err(e) = result {
                        debug!("connection from {peer_addr} failed: {e:#}");
                    }
                }
            }
        });
    }
}

async fn read_stream(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    tx: &mpsc::Sender<Inbound>,
) -> Result<()> {
    let from = peer_addr.to_string();
    while let Some(frame) = read_frame(&mut stream).await? {
        let inbound = Inbound::Frame {
            from: from.clone(),
            frame,
        };
        if tx.send(inbound).await.is_err() {
            break;
        }
    }
    debug!("connection from {peer_addr} closed");
    Ok(())
}

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    anyhow::ensure!(
        frame.len() <= MAX_FRAME_SIZE,
        "frame too large: {} bytes",
        frame.len()
    );
    let len = (frame.len() as u32).to_le_bytes();
    writer.write_all(&len).await.context("write length")?;
    writer.write_all(frame).await.context("write payload")?;
    writer.flush().await.context("flush")?;
    Ok(())
}

/// Returns `None` when the peer closed the stream between frames.
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("read length"),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_SIZE, "frame too large: {len} bytes");

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.context("read payload")?;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> TcpTransport {
        TcpTransport::new(&NodeConfig::new("test").with_gossip_bind("127.0.0.1:0")).unwrap()
    }

    #[tokio::test]
    async fn frames_roundtrip_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"hello").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_le_bytes();
        client.write_all(&len).await.unwrap();
        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn tcp_stream_delivers_frames() {
        let server = loopback();
        let client = loopback();
        let mut listener = server.listen().await.unwrap();
        assert!(listener.endpoint.starts_with("127.0.0.1:"));
        assert_ne!(listener.port, 0);

        let mut stream = client.connect(&listener.endpoint).await.unwrap();
        stream.send(b"one").await.unwrap();
        stream.send(b"two").await.unwrap();

        for expected in [&b"one"[..], &b"two"[..]] {
            let inbound = tokio::time::timeout(Duration::from_secs(2), listener.inbound.recv())
                .await
                .unwrap()
                .unwrap();
            match inbound {
                Inbound::Frame { from, frame } => {
                    assert!(from.starts_with("127.0.0.1:"));
                    assert_eq!(frame, expected);
                }
                other => panic!("expected a frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        assert!(loopback().connect(&addr.to_string()).await.is_err());
    }

    #[tokio::test]
    async fn broadcast_needs_beacon_socket() {
        assert!(loopback().broadcast(b"beacon").await.is_err());
    }

    #[test]
    fn gossip_bind_is_advertised() {
        let transport = loopback();
        assert_eq!(transport.advertised_host(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(transport.beacon_port.is_none());

        let beacon = TcpTransport::new(&NodeConfig::new("b").with_interface("10.1.2.3")).unwrap();
        assert_eq!(beacon.beacon_port, Some(5670));
        assert_eq!(beacon.advertised_host(), IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
    }
}

//! Peer transports.
//!
//! A [`Transport`] is one bound listener/dialer pair for a (family,
//! protocol) tuple. The client owns a set of them for its lifetime, all
//! sharing a single port, and treats them uniformly: the dialer races
//! across every enabled transport and the acceptors feed one admission
//! path. TCP ships in-crate; a datagram-tunnel transport plugs in through
//! the same trait.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::config::ClientConfig;

/// Boxed future used by object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A peer byte stream of unknown concrete type.
pub type PeerStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    /// A datagram-tunnel stream transport (uTP-style).
    UdpTunnel,
}

/// The (family, protocol) tuple identifying a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Network {
    pub family: Family,
    pub protocol: Protocol,
}

impl Network {
    pub const TCP4: Network = Network {
        family: Family::V4,
        protocol: Protocol::Tcp,
    };
    pub const TCP6: Network = Network {
        family: Family::V6,
        protocol: Protocol::Tcp,
    };

    pub fn as_str(&self) -> &'static str {
        match (self.protocol, self.family) {
            (Protocol::Tcp, Family::V4) => "tcp4",
            (Protocol::Tcp, Family::V6) => "tcp6",
            (Protocol::UdpTunnel, Family::V4) => "utp4",
            (Protocol::UdpTunnel, Family::V6) => "utp6",
        }
    }

    /// Whether this network may carry peer connections under the given
    /// configuration.
    pub fn peer_enabled(&self, config: &ClientConfig) -> bool {
        if config.disable_tcp && self.protocol == Protocol::Tcp {
            return false;
        }
        if config.disable_utp && self.protocol == Protocol::UdpTunnel {
            return false;
        }
        if config.disable_ipv4 && self.family == Family::V4 {
            return false;
        }
        if config.disable_ipv6 && self.family == Family::V6 {
            return false;
        }
        true
    }
}

/// One bound listener/dialer for a network. Immutable for the client's
/// lifetime; closed only when the client shuts down (by being dropped).
pub trait Transport: Send + Sync + 'static {
    fn network(&self) -> Network;

    fn local_addr(&self) -> SocketAddr;

    /// Accepts the next inbound stream.
    fn accept(&self) -> BoxFuture<'_, io::Result<(PeerStream, SocketAddr)>>;

    /// Dials a remote peer.
    fn dial(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<PeerStream>>;
}

pub struct TcpTransport {
    listener: TcpListener,
    network: Network,
    local_addr: SocketAddr,
}

impl TcpTransport {
    pub async fn bind(host: IpAddr, port: u16, family: Family) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(host, port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            network: Network {
                family,
                protocol: Protocol::Tcp,
            },
            local_addr,
        })
    }
}

impl Transport for TcpTransport {
    fn network(&self) -> Network {
        self.network
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn accept(&self) -> BoxFuture<'_, io::Result<(PeerStream, SocketAddr)>> {
        Box::pin(async move {
            let (stream, remote) = self.listener.accept().await?;
            disable_linger(&stream);
            Ok((Box::new(stream) as PeerStream, remote))
        })
    }

    fn dial(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<PeerStream>> {
        Box::pin(async move {
            if addr.is_ipv4() != (self.network.family == Family::V4) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "address family mismatch",
                ));
            }
            let stream = TcpStream::connect(addr).await?;
            disable_linger(&stream);
            Ok(Box::new(stream) as PeerStream)
        })
    }
}

// RST instead of FIN on close, so failed and raced-away dials don't pile
// up in FIN_WAIT.
fn disable_linger(stream: &TcpStream) {
    if let Err(err) = stream.set_linger(Some(Duration::ZERO)) {
        debug!("failed to disable linger: {err}");
    }
}

/// Binds a TCP transport for every enabled family. The first bind
/// discovers the port (when configured as 0) and the rest share it.
pub async fn listen_all(config: &ClientConfig) -> io::Result<Vec<Arc<dyn Transport>>> {
    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
    let mut port = config.listen_port;
    // V6 first: an unspecified v6 socket may be dual-stack, in which case
    // the v4 bind on the same port fails AddrInUse and is skipped.
    for family in [Family::V6, Family::V4] {
        let network = Network {
            family,
            protocol: Protocol::Tcp,
        };
        if !network.peer_enabled(config) {
            continue;
        }
        let host = match (config.listen_host, family) {
            (Some(ip @ IpAddr::V4(_)), Family::V4) => ip,
            (Some(ip @ IpAddr::V6(_)), Family::V6) => ip,
            (Some(_), _) => continue, // host pins the other family
            (None, Family::V4) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (None, Family::V6) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let transport = match TcpTransport::bind(host, port, family).await {
            Ok(t) => t,
            Err(err)
                if err.kind() == io::ErrorKind::AddrInUse
                    && !transports.is_empty()
                    && config.listen_host.is_none() =>
            {
                debug!("skipping {} listener: {err}", network.as_str());
                continue;
            }
            Err(err) => return Err(err),
        };
        if port == 0 {
            port = transport.local_addr().port();
        }
        transports.push(Arc::new(transport));
    }
    Ok(transports)
}

/// The single port shared by all listeners, or `None` on a mismatch.
pub fn single_listen_port(transports: &[Arc<dyn Transport>]) -> Option<u16> {
    let mut port = None;
    for transport in transports {
        let p = transport.local_addr().port();
        match port {
            None => port = Some(p),
            Some(existing) if existing != p => return None,
            Some(_) => {}
        }
    }
    port
}

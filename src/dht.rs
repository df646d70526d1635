//! The outward-facing DHT interface.
//!
//! The DHT server implementation lives outside this crate; the client
//! only consumes this trait. Inbound `announce_peer` traffic reaches the
//! client through the registered handler, and the client runs one
//! periodic announce task per (torrent, server) when configured to.

use std::io;
use std::net::SocketAddr;

use crate::info_hash::InfoHash;
use crate::transport::BoxFuture;

/// Callback invoked for every inbound `announce_peer` a server receives.
pub type AnnounceHandler = Box<dyn Fn(InfoHash, SocketAddr) + Send + Sync>;

/// One DHT server bound to a datagram socket.
pub trait DhtServer: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    /// Announces the torrent on our listen port and returns the peers
    /// discovered along the way.
    fn announce(&self, info_hash: InfoHash, port: u16)
        -> BoxFuture<'_, io::Result<Vec<SocketAddr>>>;

    /// Registers the recipient of inbound announces. Called once, at
    /// client startup.
    fn set_announce_handler(&self, handler: AnnounceHandler);

    /// Seeds the routing table with a known node.
    fn add_node(&self, addr: SocketAddr);

    /// One-line status summary for `Client::write_status`.
    fn write_status(&self, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(w, "dht server at {}", self.local_addr())
    }
}

/// Parses a `host:port` node address, as accepted by
/// `Client::add_dht_nodes`. Hostnames are not resolved here; only
/// literal addresses are accepted.
pub fn parse_node_addr(node: &str) -> Option<SocketAddr> {
    node.parse().ok()
}

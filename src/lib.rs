//! riptide - the peer-orchestration core of a BitTorrent client
//!
//! This library manages the lifecycle of concurrently-active torrent
//! sessions: it binds transports, accepts and dials peer connections,
//! negotiates optional MSE stream encryption and the BitTorrent
//! handshake, multiplexes peer traffic, exchanges torrent metadata over
//! BEP-9/10, and couples the whole graph to a DHT for peer discovery.
//!
//! Piece picking, disk storage, tracker announces and the DHT server
//! implementation are external collaborators reached through traits and
//! channels.
//!
//! # Modules
//!
//! - [`client`] - The orchestrator: torrents, connections, policies
//! - [`config`] - Configuration surface
//! - [`peer`] - BEP-3/6/9/10/40 wire types
//! - [`mse`] - MSE/PE obfuscated handshake
//! - [`transport`] - Pluggable listener/dialer transports
//! - [`bencode`] - BEP-3 bencode codec
//! - [`dht`] - Outward-facing DHT server interface
//! - [`ip_filter`] - IP range blocklist
//! - [`conn_tracker`] - Global connection accounting
//! - [`rate`] - Token-bucket rate limiting

pub mod bencode;
pub mod client;
pub mod config;
pub mod conn_tracker;
pub mod dht;
pub mod info_hash;
pub mod ip_filter;
pub mod mse;
pub mod peer;
pub mod rate;
pub mod transport;

pub use bencode::{decode, encode, BencodeError, Value};
pub use client::{
    Client, ClientError, EngineMessage, PeerCandidate, PeerSource, Storage, Torrent, TorrentSpec,
};
pub use config::{ClientConfig, EncryptionPolicy};
pub use conn_tracker::ConnTracker;
pub use dht::DhtServer;
pub use info_hash::InfoHash;
pub use ip_filter::IpFilter;
pub use mse::CryptoMethod;
pub use peer::{Bitfield, ExtensionBits, Handshake, Message, PeerId};
pub use rate::RateLimiter;
pub use transport::{Family, Network, PeerStream, Protocol, Transport};

//! The client orchestrator.
//!
//! Owns the torrent registry, the transport set, the admission policies,
//! the dialer, the handshake pipeline and every established connection.
//! All mutable client-level state sits behind one reader-writer lock,
//! with a shared notify used as the condition broadcast; torrent state
//! has its own mutex, always taken after the client lock.

mod admission;
mod connection;
mod core;
mod dialer;
mod error;
mod handshake;
mod latch;
mod torrent;

pub use self::core::Client;
pub use error::ClientError;
pub use torrent::{EngineMessage, PeerCandidate, PeerSource, Storage, Torrent, TorrentSpec};

#[cfg(test)]
mod tests;

//! Per-torrent session state: candidate peers, the half-open table,
//! established connections, and metadata (BEP-9) assembly.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use super::connection::PeerConn;
use super::core::ClientInner;
use super::dialer::reduced_dial_timeout;
use super::error::ClientError;
use crate::bencode;
use crate::info_hash::InfoHash;
use crate::peer::{
    bep40_priority, metadata_piece_count, metadata_piece_size, Bitfield, Message, MetadataMessage,
    PeerError,
};

/// Info dictionaries larger than this are treated as hostile.
const METADATA_SIZE_LIMIT: usize = 1024 * 1024;

/// External storage collaborator. The core hands over the validated info
/// dictionary when metadata exchange completes; everything else about
/// piece data lives outside this crate.
pub trait Storage: Send + Sync + 'static {
    fn on_info_bytes(&self, info_hash: InfoHash, info: &[u8]);
}

/// Where a candidate peer was learned from. Higher-ranked sources win
/// when the same address is offered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerSource {
    Incoming,
    Tracker,
    Pex,
    DhtGetPeers,
    DhtAnnouncePeer,
    User,
}

/// A peer address we may dial.
#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub supports_encryption: bool,
}

impl PeerCandidate {
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            source,
            supports_encryption: false,
        }
    }
}

/// Sugar for adding a torrent with everything known up front.
pub struct TorrentSpec {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub info_bytes: Option<Bytes>,
    pub storage: Option<Arc<dyn Storage>>,
}

impl TorrentSpec {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            display_name: None,
            trackers: Vec::new(),
            info_bytes: None,
            storage: None,
        }
    }
}

/// A non-core message forwarded to the external piece/request engine.
#[derive(Debug)]
pub struct EngineMessage {
    pub conn_id: u64,
    pub remote: SocketAddr,
    pub message: Message,
}

/// Public handle to a torrent session.
#[derive(Clone)]
pub struct Torrent {
    pub(crate) inner: Arc<TorrentInner>,
}

pub(crate) struct TorrentInner {
    pub(crate) client: Weak<ClientInner>,
    pub(crate) info_hash: InfoHash,
    pub(crate) state: Mutex<TorrentState>,
}

pub(crate) struct TorrentState {
    pub display_name: Option<String>,
    pub info_bytes: Option<Bytes>,
    pub pieces: Option<Bitfield>,
    pub metadata: Option<MetadataBuffer>,
    /// Candidates keyed by (BEP-40 priority, addr); first entry is the
    /// next to dial.
    pub candidates: BTreeMap<(u32, SocketAddr), PeerCandidate>,
    pub known_addrs: HashMap<SocketAddr, u32>,
    pub conns: HashMap<u64, Arc<PeerConn>>,
    pub half_open: HashMap<SocketAddr, PeerCandidate>,
    pub trackers: Vec<String>,
    pub networking_enabled: bool,
    pub max_established_conns: usize,
    pub closed: bool,
    pub storage: Option<Arc<dyn Storage>>,
    pub engine_tx: UnboundedSender<EngineMessage>,
    pub engine_rx: Option<UnboundedReceiver<EngineMessage>>,
}

/// Piecewise assembly buffer for the info dictionary.
pub(crate) struct MetadataBuffer {
    pub size: usize,
    buf: Vec<u8>,
    have: Vec<bool>,
}

impl MetadataBuffer {
    fn new(size: usize) -> Self {
        Self {
            size,
            buf: vec![0; size],
            have: vec![false; metadata_piece_count(size)],
        }
    }

    fn is_complete(&self) -> bool {
        !self.have.is_empty() && self.have.iter().all(|&h| h)
    }

    fn missing_pieces(&self) -> Vec<u32> {
        self.have
            .iter()
            .enumerate()
            .filter(|(_, &have)| !have)
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn have_piece(&self, piece: u32) -> bool {
        self.have.get(piece as usize).copied().unwrap_or(false)
    }

    fn piece_bytes(&self, piece: u32) -> Option<Bytes> {
        if !self.have_piece(piece) {
            return None;
        }
        let start = piece as usize * crate::peer::METADATA_PIECE_SIZE;
        let len = metadata_piece_size(piece, self.size);
        Some(Bytes::copy_from_slice(&self.buf[start..start + len]))
    }

    fn store(&mut self, piece: u32, data: &[u8]) -> bool {
        let expected = metadata_piece_size(piece, self.size);
        if expected == 0 || data.len() != expected {
            return false;
        }
        let start = piece as usize * crate::peer::METADATA_PIECE_SIZE;
        self.buf[start..start + expected].copy_from_slice(data);
        self.have[piece as usize] = true;
        true
    }

    fn reset(&mut self) {
        self.have.fill(false);
    }
}

/// What to do after a metadata mutation, performed outside the lock.
enum MetadataOutcome {
    None,
    Completed(Bytes),
    Mismatch,
}

impl TorrentInner {
    pub(crate) fn new(
        client: Weak<ClientInner>,
        info_hash: InfoHash,
        max_established_conns: usize,
        storage: Option<Arc<dyn Storage>>,
    ) -> Arc<Self> {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            client,
            info_hash,
            state: Mutex::new(TorrentState {
                display_name: None,
                info_bytes: None,
                pieces: None,
                metadata: None,
                candidates: BTreeMap::new(),
                known_addrs: HashMap::new(),
                conns: HashMap::new(),
                half_open: HashMap::new(),
                trackers: Vec::new(),
                networking_enabled: true,
                max_established_conns,
                closed: false,
                storage,
                engine_tx,
                engine_rx: Some(engine_rx),
            }),
        })
    }

    pub(crate) fn have_info(&self) -> bool {
        self.state.lock().info_bytes.is_some()
    }

    pub(crate) fn have_all_pieces(&self) -> bool {
        self.state
            .lock()
            .pieces
            .as_ref()
            .is_some_and(|p| p.is_complete())
    }

    /// Advertised metadata size: the real size once info is known, the
    /// in-progress download size otherwise.
    pub(crate) fn metadata_size(&self) -> Option<i64> {
        let state = self.state.lock();
        state
            .info_bytes
            .as_ref()
            .map(|b| b.len() as i64)
            .or(state.metadata.as_ref().map(|m| m.size as i64))
    }

    /// Under dial pressure each peer gets a smaller slice of the nominal
    /// timeout, floored at the configured minimum.
    pub(crate) fn dial_timeout(&self) -> Duration {
        let client = match self.client.upgrade() {
            Some(client) => client,
            None => return Duration::ZERO,
        };
        let pending = self.state.lock().candidates.len();
        reduced_dial_timeout(
            client.config.min_dial_timeout,
            client.config.nominal_dial_timeout,
            client.config.half_open_conns_per_torrent,
            pending,
        )
    }

    /// Merges candidates by address, keeping the best source label, and
    /// kicks the connection scheduler.
    pub(crate) fn add_peers(self: &Arc<Self>, peers: Vec<PeerCandidate>) {
        let client = match self.client.upgrade() {
            Some(client) => client,
            None => return,
        };
        let mut added = false;
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            for peer in peers {
                let priority = bep40_priority(client.public_addr(peer.addr.ip()), peer.addr);
                match state.known_addrs.get(&peer.addr) {
                    Some(&existing_priority) => {
                        let key = (existing_priority, peer.addr);
                        if let Some(existing) = state.candidates.get_mut(&key) {
                            if peer.source > existing.source {
                                existing.source = peer.source;
                            }
                            existing.supports_encryption |= peer.supports_encryption;
                        }
                    }
                    None => {
                        state.known_addrs.insert(peer.addr, priority);
                        state.candidates.insert((priority, peer.addr), peer);
                        added = true;
                    }
                }
            }
        }
        if added {
            client.open_new_conns(self);
        }
    }

    /// Registers an established connection, enforcing the duplicate-id
    /// and capacity rules.
    pub(crate) fn add_connection(&self, conn: &Arc<PeerConn>) -> Result<(), &'static str> {
        let mut state = self.state.lock();
        if state.closed {
            return Err("torrent closed");
        }
        if state
            .conns
            .values()
            .any(|existing| existing.peer_id == conn.peer_id)
        {
            // Tie-break: the older connection stays.
            return Err("duplicate peer id");
        }
        if state.conns.len() >= state.max_established_conns {
            // The lowest-scoring slot holder gives way, and only to a
            // newcomer that outranks it. Ties keep the older connection.
            let victim = state
                .conns
                .values()
                .min_by_key(|c| (c.score(), std::cmp::Reverse(c.id)))
                .map(Arc::clone);
            match victim {
                Some(victim) if conn.score() > victim.score() => {
                    state.conns.remove(&victim.id);
                    victim.close();
                }
                _ => return Err("connection limit reached"),
            }
        }
        state.conns.insert(conn.id, Arc::clone(conn));
        Ok(())
    }

    /// Removes a connection if still registered. Safe to call twice; the
    /// eviction path may have removed it already.
    pub(crate) fn remove_connection(&self, conn_id: u64) -> bool {
        let mut state = self.state.lock();
        state.conns.remove(&conn_id).is_some()
    }

    /// Handles the peer's extended handshake: records it and, while we
    /// lack the info dictionary, starts or continues metadata requests.
    pub(crate) fn on_extended_handshake(
        self: &Arc<Self>,
        conn: &Arc<PeerConn>,
        hs: crate::peer::ExtendedHandshake,
    ) {
        let metadata_size = hs.metadata_size;
        let ut_metadata = hs.extension_id("ut_metadata");
        {
            let mut ext = conn.ext.lock();
            ext.peer_handshake = Some(hs);
        }

        let (Some(size), Some(_)) = (metadata_size, ut_metadata) else {
            return;
        };
        if size <= 0 || size as usize > METADATA_SIZE_LIMIT {
            debug!(
                torrent = %self.info_hash,
                size, "ignoring implausible metadata size"
            );
            return;
        }
        {
            let mut state = self.state.lock();
            if state.closed || state.info_bytes.is_some() {
                return;
            }
            let size = size as usize;
            if state.metadata.as_ref().map(|m| m.size) != Some(size) {
                state.metadata = Some(MetadataBuffer::new(size));
            }
        }
        self.request_metadata_from(conn);
    }

    /// Issues requests to one connection for every metadata piece that is
    /// neither received nor already pending on that connection.
    pub(crate) fn request_metadata_from(self: &Arc<Self>, conn: &Arc<PeerConn>) {
        let Some(ut_id) = conn.peer_ut_metadata_id() else {
            return;
        };
        let pieces = {
            let state = self.state.lock();
            let Some(metadata) = &state.metadata else {
                return;
            };
            if state.info_bytes.is_some() {
                return;
            }
            let mut ext = conn.ext.lock();
            ext.metadata_requested
                .resize(metadata_piece_count(metadata.size), false);
            let mut pieces = Vec::new();
            for piece in metadata.missing_pieces() {
                if !ext.metadata_requested[piece as usize] {
                    ext.metadata_requested[piece as usize] = true;
                    pieces.push(piece);
                }
            }
            pieces
        };
        for piece in pieces {
            conn.send(Message::Extended {
                id: ut_id,
                payload: MetadataMessage::request(piece).encode(),
            });
        }
    }

    /// Dispatches one inbound ut_metadata payload.
    pub(crate) fn on_metadata_message(
        self: &Arc<Self>,
        conn: &Arc<PeerConn>,
        payload: &[u8],
    ) -> Result<(), PeerError> {
        use crate::peer::MetadataMessageType::*;

        let msg = MetadataMessage::decode(payload)?;
        match msg.msg_type {
            Request => {
                let reply = {
                    let state = self.state.lock();
                    self.metadata_piece_for_serving(&state, msg.piece)
                };
                let response = match reply {
                    Some((data, total)) => MetadataMessage::data(msg.piece, total, data),
                    None => MetadataMessage::reject(msg.piece),
                };
                if let Some(ut_id) = conn.peer_ut_metadata_id() {
                    conn.send(Message::Extended {
                        id: ut_id,
                        payload: response.encode(),
                    });
                }
                Ok(())
            }
            Data => {
                let data = msg.data.as_deref().unwrap_or(&[]);
                let outcome = {
                    let mut state = self.state.lock();
                    let requested = {
                        let mut ext = conn.ext.lock();
                        match ext.metadata_requested.get_mut(msg.piece as usize) {
                            Some(flag) if *flag => {
                                *flag = false;
                                true
                            }
                            _ => false,
                        }
                    };
                    if !requested {
                        return Err(PeerError::Extension(format!(
                            "unexpected metadata piece {}",
                            msg.piece
                        )));
                    }
                    conn.stats.add_useful_chunk();
                    let Some(metadata) = state.metadata.as_mut() else {
                        return Ok(());
                    };
                    if !metadata.store(msg.piece, data) {
                        return Err(PeerError::Extension(format!(
                            "metadata piece {} has bad length {}",
                            msg.piece,
                            data.len()
                        )));
                    }
                    self.maybe_complete_metadata(&mut state)
                };
                self.apply_metadata_outcome(outcome);
                Ok(())
            }
            Reject => {
                let mut ext = conn.ext.lock();
                if let Some(flag) = ext.metadata_requested.get_mut(msg.piece as usize) {
                    *flag = false;
                }
                Ok(())
            }
        }
    }

    fn metadata_piece_for_serving(&self, state: &TorrentState, piece: u32) -> Option<(Bytes, i64)> {
        if let Some(info) = &state.info_bytes {
            let len = metadata_piece_size(piece, info.len());
            if len == 0 {
                return None;
            }
            let start = piece as usize * crate::peer::METADATA_PIECE_SIZE;
            return Some((info.slice(start..start + len), info.len() as i64));
        }
        let metadata = state.metadata.as_ref()?;
        metadata
            .piece_bytes(piece)
            .map(|bytes| (bytes, metadata.size as i64))
    }

    fn maybe_complete_metadata(&self, state: &mut TorrentState) -> MetadataOutcome {
        let Some(metadata) = &state.metadata else {
            return MetadataOutcome::None;
        };
        if !metadata.is_complete() {
            return MetadataOutcome::None;
        }
        let digest: [u8; 20] = Sha1::digest(&metadata.buf).into();
        if digest != *self.info_hash.as_bytes() {
            debug!(torrent = %self.info_hash, "metadata failed validation, discarding");
            if let Some(metadata) = state.metadata.as_mut() {
                metadata.reset();
            }
            for conn in state.conns.values() {
                conn.ext.lock().metadata_requested.fill(false);
            }
            return MetadataOutcome::Mismatch;
        }
        let info = Bytes::from(metadata.buf.clone());
        self.install_info_bytes(state, info.clone());
        MetadataOutcome::Completed(info)
    }

    fn apply_metadata_outcome(self: &Arc<Self>, outcome: MetadataOutcome) {
        match outcome {
            MetadataOutcome::None => {}
            MetadataOutcome::Completed(info) => {
                let storage = self.state.lock().storage.clone();
                if let Some(storage) = storage {
                    storage.on_info_bytes(self.info_hash, &info);
                }
                if let Some(client) = self.client.upgrade() {
                    client.broadcast();
                }
            }
            MetadataOutcome::Mismatch => {
                let conns: Vec<Arc<PeerConn>> =
                    self.state.lock().conns.values().cloned().collect();
                for conn in conns {
                    self.request_metadata_from(&conn);
                }
            }
        }
    }

    /// Installs validated info bytes: records them, sizes the pieces
    /// bitmap, and drops the assembly buffer.
    fn install_info_bytes(&self, state: &mut TorrentState, info: Bytes) {
        state.pieces = piece_count_from_info(&info).map(Bitfield::new);
        if state.pieces.is_none() {
            debug!(
                torrent = %self.info_hash,
                "info bytes match the hash but the piece list is unreadable"
            );
        }
        state.info_bytes = Some(info);
        state.metadata = None;
    }

    pub(crate) fn set_info_bytes(self: &Arc<Self>, info: Bytes) -> Result<(), ClientError> {
        let digest: [u8; 20] = Sha1::digest(&info).into();
        if digest != *self.info_hash.as_bytes() {
            return Err(ClientError::InfoHashMismatch);
        }
        let storage = {
            let mut state = self.state.lock();
            if state.info_bytes.is_some() {
                return Ok(());
            }
            self.install_info_bytes(&mut state, info.clone());
            state.storage.clone()
        };
        if let Some(storage) = storage {
            storage.on_info_bytes(self.info_hash, &info);
        }
        if let Some(client) = self.client.upgrade() {
            client.broadcast();
        }
        Ok(())
    }

    /// Closes the session: marks it closed and tears down every
    /// connection. Half-open entries drain through their dial tasks so
    /// the global counter stays consistent.
    pub(crate) fn close(&self) {
        let conns: Vec<Arc<PeerConn>> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.networking_enabled = false;
            state.candidates.clear();
            state.known_addrs.clear();
            state.conns.drain().map(|(_, conn)| conn).collect()
        };
        for conn in conns {
            conn.close();
        }
    }

    pub(crate) fn name(&self) -> String {
        let state = self.state.lock();
        state
            .display_name
            .clone()
            .unwrap_or_else(|| self.info_hash.to_string())
    }
}

impl Torrent {
    pub fn info_hash(&self) -> InfoHash {
        self.inner.info_hash
    }

    pub fn name(&self) -> String {
        self.inner.name()
    }

    pub fn set_display_name(&self, name: impl Into<String>) {
        self.inner.state.lock().display_name = Some(name.into());
    }

    pub fn have_info(&self) -> bool {
        self.inner.have_info()
    }

    pub fn info_bytes(&self) -> Option<Bytes> {
        self.inner.state.lock().info_bytes.clone()
    }

    pub fn metadata_size(&self) -> Option<i64> {
        self.inner.metadata_size()
    }

    /// Supplies the info dictionary out-of-band (e.g. from a .torrent
    /// file). Validated against the info hash.
    pub fn set_info_bytes(&self, info: Bytes) -> Result<(), ClientError> {
        self.inner.set_info_bytes(info)
    }

    pub fn num_pieces(&self) -> Option<usize> {
        self.inner.state.lock().pieces.as_ref().map(|p| p.len())
    }

    /// Marks a piece complete. Called by the external piece engine as
    /// verified data lands.
    pub fn set_piece_complete(&self, index: usize) {
        let complete = {
            let mut state = self.inner.state.lock();
            match state.pieces.as_mut() {
                Some(pieces) => {
                    pieces.set(index);
                    pieces.is_complete()
                }
                None => false,
            }
        };
        if complete {
            if let Some(client) = self.inner.client.upgrade() {
                client.broadcast();
            }
        }
    }

    pub fn have_all_pieces(&self) -> bool {
        self.inner.have_all_pieces()
    }

    pub fn add_peers(&self, peers: Vec<PeerCandidate>) {
        self.inner.add_peers(peers);
    }

    /// Merges announce URLs, deduplicated, order preserved.
    pub fn add_trackers(&self, trackers: impl IntoIterator<Item = String>) {
        let mut state = self.inner.state.lock();
        for tracker in trackers {
            if !state.trackers.contains(&tracker) {
                state.trackers.push(tracker);
            }
        }
    }

    pub fn trackers(&self) -> Vec<String> {
        self.inner.state.lock().trackers.clone()
    }

    pub fn set_max_established_conns(&self, max: usize) {
        self.inner.state.lock().max_established_conns = max;
    }

    pub fn set_networking_enabled(&self, enabled: bool) {
        self.inner.state.lock().networking_enabled = enabled;
        if enabled {
            if let Some(client) = self.inner.client.upgrade() {
                client.open_new_conns(&self.inner);
            }
        }
    }

    /// Takes the stream of messages destined for the external
    /// piece/request engine. Yields `None` after the first call.
    pub fn engine_messages(&self) -> Option<UnboundedReceiver<EngineMessage>> {
        self.inner.state.lock().engine_rx.take()
    }

    pub fn num_conns(&self) -> usize {
        self.inner.state.lock().conns.len()
    }

    pub fn num_half_open(&self) -> usize {
        self.inner.state.lock().half_open.len()
    }

    pub fn num_candidates(&self) -> usize {
        self.inner.state.lock().candidates.len()
    }
}

fn piece_count_from_info(info: &[u8]) -> Option<usize> {
    let value = bencode::decode(info).ok()?;
    let pieces = value.get(b"pieces")?.as_bytes()?;
    if pieces.len() % 20 != 0 {
        return None;
    }
    Some(pieces.len() / 20)
}

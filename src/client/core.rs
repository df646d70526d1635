//! The client itself: construction, the torrent registry, accept loops,
//! outbound connection scheduling, and lifecycle.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::admission::AdmissionState;
use super::connection::{run_connection, PeerConn};
use super::dialer::dial_first;
use super::error::ClientError;
use super::handshake::{self, HandshakeError, Handshaken};
use super::latch::Latch;
use super::torrent::{PeerCandidate, PeerSource, Storage, Torrent, TorrentInner, TorrentSpec};
use crate::config::ClientConfig;
use crate::conn_tracker::ConnTracker;
use crate::dht::{parse_node_addr, DhtServer};
use crate::info_hash::InfoHash;
use crate::peer::{ExtensionBits, PeerError, PeerId, UT_METADATA_ID, UT_PEX_ID};
use crate::rate::RateLimiter;
use crate::transport::{listen_all, single_listen_port, Network, PeerStream, Transport};

/// The accept limiter forgives a /24 after this long.
const ACCEPT_LIMIT_CLEAR_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Cadence of the per-(torrent, server) DHT announcer.
const DHT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Concurrent-connection budget when no tracker is shared in.
const DEFAULT_CONN_BUDGET: usize = 500;
/// Outbound dial pacing: permits per second and burst.
const DIAL_RATE: f64 = 10.0;
const DIAL_BURST: f64 = 10.0;
/// Request queue depth we advertise in the extended handshake.
const EXTENDED_HANDSHAKE_REQQ: i64 = 64;

#[derive(Default)]
pub(crate) struct ClientStats {
    pub accepted_conns: AtomicU64,
    pub rejected_accepts: AtomicU64,
    pub bad_handshakes: AtomicU64,
    pub unknown_info_hash_accepts: AtomicU64,
    pub successful_dials: AtomicU64,
    pub unsuccessful_dials: AtomicU64,
    pub conns_to_self: AtomicU64,
    pub completed_handshakes: AtomicU64,
}

impl ClientStats {
    fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A BitTorrent client: zero or more torrents, the listen sockets, the
/// blocklist and DHT wiring. Cheap to clone; `close` tears everything
/// down.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) peer_id: PeerId,
    pub(crate) extension_bits: ExtensionBits,
    pub(crate) transports: Vec<Arc<dyn Transport>>,
    pub(crate) dht_servers: Vec<Arc<dyn DhtServer>>,
    pub(crate) conn_tracker: Arc<ConnTracker>,
    pub(crate) dial_limiter: Arc<RateLimiter>,
    pub(crate) download_limiter: Option<Arc<RateLimiter>>,
    pub(crate) state: RwLock<ClientState>,
    /// The shared condition broadcast: waiters re-check their predicate.
    pub(crate) event: Notify,
    pub(crate) closed: Arc<Latch>,
    pub(crate) stats: ClientStats,
    on_close: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    next_conn_id: AtomicU64,
}

pub(crate) struct ClientState {
    torrents: HashMap<InfoHash, Arc<TorrentInner>>,
    pub(crate) admission: AdmissionState,
    num_half_open: usize,
}

impl Client {
    /// Binds the configured listeners and starts the client.
    pub async fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config
            .validate()
            .map_err(ClientError::InvalidConfig)?;
        let transports = listen_all(&config).await?;
        Self::with_transports(config, transports).await
    }

    /// Starts a client over an explicit transport set. This is how a
    /// datagram-tunnel transport joins the dial race and accept loops.
    pub async fn with_transports(
        config: ClientConfig,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<Self, ClientError> {
        config
            .validate()
            .map_err(ClientError::InvalidConfig)?;
        if !transports.is_empty() && single_listen_port(&transports).is_none() {
            return Err(ClientError::InvalidConfig(
                "listeners bound to mismatched ports".into(),
            ));
        }

        let peer_id = config
            .peer_id
            .unwrap_or_else(|| PeerId::generate(&config.bep20));
        let extension_bits = ExtensionBits::local_default(!config.no_dht);
        let conn_tracker = config
            .conn_tracker
            .clone()
            .unwrap_or_else(|| ConnTracker::new(DEFAULT_CONN_BUDGET));
        let download_limiter = config.download_rate_limiter.clone();
        let dht_servers = if config.no_dht {
            Vec::new()
        } else {
            config.dht_servers.clone()
        };
        let blocklist = config.ip_blocklist.clone();

        let inner = Arc::new(ClientInner {
            config,
            peer_id,
            extension_bits,
            transports,
            dht_servers,
            conn_tracker,
            dial_limiter: RateLimiter::new(DIAL_RATE, DIAL_BURST),
            download_limiter,
            state: RwLock::new(ClientState {
                torrents: HashMap::new(),
                admission: AdmissionState::new(blocklist),
                num_half_open: 0,
            }),
            event: Notify::new(),
            closed: Arc::new(Latch::new()),
            stats: ClientStats::default(),
            on_close: Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
        });

        for server in &inner.dht_servers {
            let weak = Arc::downgrade(&inner);
            server.set_announce_handler(Box::new(move |info_hash, addr| {
                if let Some(client) = weak.upgrade() {
                    client.on_dht_announce_peer(info_hash, addr);
                }
            }));
        }

        for transport in &inner.transports {
            if !transport.network().peer_enabled(&inner.config) {
                continue;
            }
            let this = Arc::clone(&inner);
            let transport = Arc::clone(transport);
            tokio::spawn(async move { this.accept_loop(transport).await });
        }

        {
            let this = Arc::clone(&inner);
            tokio::spawn(async move { this.accept_limit_clearer().await });
        }

        info!(
            peer_id = %inner.peer_id,
            port = inner.local_port(),
            "client started"
        );
        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// The port shared by every listener; 0 when not listening.
    pub fn local_port(&self) -> u16 {
        self.inner.local_port()
    }

    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .transports
            .iter()
            .map(|t| t.local_addr())
            .collect()
    }

    /// Adds a torrent by info hash, returning the session and whether it
    /// was newly created.
    pub fn add_torrent(&self, info_hash: InfoHash) -> Result<(Torrent, bool), ClientError> {
        self.add_torrent_with_storage(info_hash, None)
    }

    /// Like [`add_torrent`](Self::add_torrent) with a storage override.
    /// The override is ignored when the torrent already exists.
    pub fn add_torrent_with_storage(
        &self,
        info_hash: InfoHash,
        storage: Option<Arc<dyn Storage>>,
    ) -> Result<(Torrent, bool), ClientError> {
        if self.inner.closed.is_set() {
            return Err(ClientError::AlreadyClosed);
        }
        let (torrent, is_new) = {
            let mut state = self.inner.state.write();
            match state.torrents.get(&info_hash) {
                Some(existing) => (
                    Torrent {
                        inner: Arc::clone(existing),
                    },
                    false,
                ),
                None => {
                    let inner = TorrentInner::new(
                        Arc::downgrade(&self.inner),
                        info_hash,
                        self.inner.config.established_conns_per_torrent,
                        storage,
                    );
                    state.torrents.insert(info_hash, Arc::clone(&inner));
                    // A new torrent may want peers from previously
                    // throttled sources.
                    state.admission.clear_accept_limits();
                    (Torrent { inner }, true)
                }
            }
        };
        if is_new {
            if self.inner.config.periodically_announce_torrents_to_dht {
                for server in &self.inner.dht_servers {
                    let this = Arc::clone(&self.inner);
                    let torrent = Arc::clone(&torrent.inner);
                    let server = Arc::clone(server);
                    tokio::spawn(async move { this.dht_announcer(torrent, server).await });
                }
            }
            self.inner.broadcast();
        }
        Ok((torrent, is_new))
    }

    /// Adds or merges a torrent spec: trackers are merged, the display
    /// name replaced, and info bytes installed if supplied.
    pub fn add_torrent_spec(&self, spec: TorrentSpec) -> Result<(Torrent, bool), ClientError> {
        let (torrent, is_new) = self.add_torrent_with_storage(spec.info_hash, spec.storage)?;
        if let Some(name) = spec.display_name {
            torrent.set_display_name(name);
        }
        if let Some(info) = spec.info_bytes {
            torrent.set_info_bytes(info)?;
        }
        torrent.add_trackers(spec.trackers);
        self.inner.open_new_conns(&torrent.inner);
        Ok((torrent, is_new))
    }

    pub fn torrent(&self, info_hash: InfoHash) -> Option<Torrent> {
        self.inner
            .state
            .read()
            .torrents
            .get(&info_hash)
            .map(|inner| Torrent {
                inner: Arc::clone(inner),
            })
    }

    pub fn torrents(&self) -> Vec<Torrent> {
        self.inner
            .state
            .read()
            .torrents
            .values()
            .map(|inner| Torrent {
                inner: Arc::clone(inner),
            })
            .collect()
    }

    /// Removes and closes a torrent session.
    pub fn drop_torrent(&self, info_hash: InfoHash) -> Result<(), ClientError> {
        let torrent = self
            .inner
            .state
            .write()
            .torrents
            .remove(&info_hash)
            .ok_or(ClientError::NotFound)?;
        torrent.close();
        self.inner.broadcast();
        Ok(())
    }

    /// Blocks until every torrent has its info and all pieces, or the
    /// client closes first. Returns whether completion was reached.
    pub async fn wait_all(&self) -> bool {
        loop {
            let notified = self.inner.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.closed.is_set() {
                return false;
            }
            if self.all_torrents_complete() {
                return true;
            }
            notified.await;
        }
    }

    fn all_torrents_complete(&self) -> bool {
        let state = self.inner.state.read();
        state
            .torrents
            .values()
            .all(|t| t.have_info() && t.have_all_pieces())
    }

    /// Stops the client: latches `closed`, closes every torrent and its
    /// connections, runs the registered callbacks, and wakes every
    /// waiter. Safe to call more than once.
    pub fn close(&self) {
        if !self.inner.closed.set() {
            return;
        }
        let torrents: Vec<_> = self.inner.state.read().torrents.values().cloned().collect();
        let callbacks = std::mem::take(&mut *self.inner.on_close.lock());
        for torrent in torrents {
            torrent.close();
        }
        for callback in callbacks {
            callback();
        }
        self.inner.broadcast();
    }

    /// Completes when the client has been closed.
    pub async fn closed(&self) {
        self.inner.closed.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_set()
    }

    /// Registers a callback to run during `close`.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.on_close.lock().push(Box::new(callback));
    }

    /// Bans a peer IP for the rest of the process lifetime.
    pub fn ban_peer_ip(&self, ip: IpAddr) {
        self.inner.state.write().admission.ban_ip(ip);
    }

    pub fn bad_peer_ips(&self) -> Vec<IpAddr> {
        self.inner.state.read().admission.bad_peer_ips()
    }

    pub fn dht_servers(&self) -> &[Arc<dyn DhtServer>] {
        &self.inner.dht_servers
    }

    /// Seeds every DHT server with the given `host:port` nodes; entries
    /// that aren't literal addresses are skipped with an error log.
    pub fn add_dht_nodes(&self, nodes: &[&str]) {
        for node in nodes {
            match parse_node_addr(node) {
                Some(addr) => self.inner.add_dht_node(addr),
                None => error!("won't add DHT node with bad address: {node:?}"),
            }
        }
    }

    /// Writes a human-readable status snapshot, e.g. for an HTTP status
    /// page.
    pub fn write_status(&self, w: &mut dyn io::Write) -> io::Result<()> {
        writeln!(w, "Listen port: {}", self.local_port())?;
        writeln!(w, "Peer ID: {}", self.peer_id())?;
        let (banned, half_open, torrents) = {
            let state = self.inner.state.read();
            let torrents: Vec<_> = state.torrents.values().cloned().collect();
            (
                state.admission.bad_peer_ips().len(),
                state.num_half_open,
                torrents,
            )
        };
        writeln!(w, "Banned IPs: {banned}")?;
        writeln!(w, "Half-open connections: {half_open}")?;
        let stats = &self.inner.stats;
        writeln!(
            w,
            "Dials: {} ok, {} failed; accepts: {} ok, {} rejected; conns to self: {}",
            stats.successful_dials.load(Ordering::Relaxed),
            stats.unsuccessful_dials.load(Ordering::Relaxed),
            stats.accepted_conns.load(Ordering::Relaxed),
            stats.rejected_accepts.load(Ordering::Relaxed),
            stats.conns_to_self.load(Ordering::Relaxed),
        )?;
        for server in &self.inner.dht_servers {
            server.write_status(w)?;
        }
        let mut torrents = torrents;
        torrents.sort_by_key(|t| t.info_hash);
        writeln!(w, "# Torrents: {}", torrents.len())?;
        for torrent in torrents {
            let state = torrent.state.lock();
            let progress = match (&state.info_bytes, &state.pieces) {
                (Some(_), Some(pieces)) => {
                    format!("{}/{} pieces", pieces.count(), pieces.len())
                }
                (Some(_), None) => "have info".to_string(),
                (None, _) => "<missing metainfo>".to_string(),
            };
            writeln!(
                w,
                "{}: {} conns, {} half-open, {} candidates, {}",
                state
                    .display_name
                    .clone()
                    .unwrap_or_else(|| torrent.info_hash.to_string()),
                state.conns.len(),
                state.half_open.len(),
                state.candidates.len(),
                progress,
            )?;
            for conn in state.conns.values() {
                writeln!(
                    w,
                    "  {} {} {:?} [{}]: read {}B, wrote {}B, sent {} haves",
                    conn.remote,
                    conn.peer_id,
                    conn.crypto,
                    conn.status_flags(),
                    conn.stats.bytes_read(),
                    conn.stats.bytes_written(),
                    conn.sent_haves
                        .lock()
                        .as_ref()
                        .map(|haves| haves.count())
                        .unwrap_or(0),
                )?;
            }
        }
        Ok(())
    }
}

impl ClientInner {
    pub(crate) fn broadcast(&self) {
        self.event.notify_waiters();
    }

    pub(crate) fn local_port(&self) -> u16 {
        single_listen_port(&self.transports).unwrap_or(0)
    }

    pub(crate) fn have_dht_server(&self) -> bool {
        !self.dht_servers.is_empty()
    }

    pub(crate) fn add_dht_node(&self, addr: SocketAddr) {
        for server in &self.dht_servers {
            server.add_node(addr);
        }
    }

    /// Our address as the given peer should see it: the configured
    /// public IP for the peer's family, else a listener address.
    pub(crate) fn public_addr(&self, peer: IpAddr) -> SocketAddr {
        let ip = if peer.is_ipv4() {
            self.config
                .public_ip4
                .map(IpAddr::V4)
                .or_else(|| self.listener_ip(|ip| ip.is_ipv4()))
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        } else {
            self.config
                .public_ip6
                .map(IpAddr::V6)
                .or_else(|| self.listener_ip(|ip| ip.is_ipv6()))
                .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        };
        SocketAddr::new(ip, self.local_port())
    }

    fn listener_ip(&self, pred: impl Fn(IpAddr) -> bool) -> Option<IpAddr> {
        self.transports
            .iter()
            .map(|t| t.local_addr().ip())
            .find(|ip| pred(*ip))
    }

    pub(crate) fn build_extended_handshake(
        &self,
        torrent: &TorrentInner,
        conn: &PeerConn,
    ) -> crate::peer::ExtendedHandshake {
        let mut hs = crate::peer::ExtendedHandshake {
            client: Some(self.config.extended_handshake_client_version.clone()),
            your_ip: Some(conn.remote.ip()),
            reqq: Some(EXTENDED_HANDSHAKE_REQQ),
            metadata_size: torrent.metadata_size(),
            encryption: !self.config.encryption_policy.disabled(),
            port: Some(self.local_port()).filter(|&p| p != 0),
            ipv4: self.config.public_ip4.map(|ip| ip.octets()),
            ipv6: self.config.public_ip6.map(|ip| ip.octets()),
            ..Default::default()
        };
        hs.extensions.insert("ut_metadata".into(), UT_METADATA_ID);
        if !self.config.disable_pex {
            hs.extensions.insert("ut_pex".into(), UT_PEX_ID);
        }
        hs
    }

    fn on_dht_announce_peer(self: &Arc<Self>, info_hash: InfoHash, addr: SocketAddr) {
        let torrent = self.state.read().torrents.get(&info_hash).cloned();
        if let Some(torrent) = torrent {
            torrent.add_peers(vec![PeerCandidate::new(addr, PeerSource::DhtAnnouncePeer)]);
        }
    }

    /// Collects the secret-key candidates offered to MSE receivers: every
    /// loaded info hash.
    fn skeys(&self) -> Vec<[u8; 20]> {
        self.state
            .read()
            .torrents
            .keys()
            .map(|ih| *ih.as_bytes())
            .collect()
    }

    /// Starts outgoing connections while the session wants and may have
    /// them. Candidates failing admission are discarded.
    pub(crate) fn open_new_conns(self: &Arc<Self>, torrent: &Arc<TorrentInner>) {
        let mut state = self.state.write();
        self.open_new_conns_locked(&mut state, torrent);
    }

    fn open_new_conns_locked(self: &Arc<Self>, state: &mut ClientState, torrent: &Arc<TorrentInner>) {
        if self.closed.is_set() {
            return;
        }
        let mut ts = torrent.state.lock();
        if ts.closed || !ts.networking_enabled {
            return;
        }
        while ts.conns.len() < ts.max_established_conns
            && ts.half_open.len() < self.config.half_open_conns_per_torrent
        {
            let Some(((_, addr), peer)) = ts.candidates.pop_first() else {
                break;
            };
            ts.known_addrs.remove(&addr);
            if state.admission.bad_peer_addr(addr) {
                continue;
            }
            if addr.is_ipv4() && (self.config.disable_ipv4 || self.config.disable_ipv4_peers) {
                continue;
            }
            if addr.is_ipv6() && self.config.disable_ipv6 {
                continue;
            }
            if ts.half_open.contains_key(&addr)
                || ts.conns.values().any(|c| c.remote == addr)
            {
                continue;
            }
            ts.half_open.insert(addr, peer.clone());
            state.num_half_open += 1;
            let this = Arc::clone(self);
            let torrent = Arc::clone(torrent);
            tokio::spawn(async move { this.outgoing_connection(torrent, peer).await });
        }
    }

    /// Clears a half-open entry and reruns the scheduler for every
    /// torrent. The entry must exist; a missing one is a broken
    /// invariant.
    fn no_longer_half_open(self: &Arc<Self>, torrent: &Arc<TorrentInner>, addr: SocketAddr) {
        let mut state = self.state.write();
        if torrent.state.lock().half_open.remove(&addr).is_none() {
            panic!("half-open table has no entry for {addr}");
        }
        state.num_half_open -= 1;
        let torrents: Vec<_> = state.torrents.values().cloned().collect();
        for torrent in &torrents {
            self.open_new_conns_locked(&mut state, torrent);
        }
    }

    /// Dials out and runs the connection. The address is already marked
    /// half-open.
    async fn outgoing_connection(self: Arc<Self>, torrent: Arc<TorrentInner>, peer: PeerCandidate) {
        self.dial_limiter.acquire(1).await;
        let result = if self.closed.is_set() {
            Ok(None)
        } else {
            self.establish_outgoing_conn(&torrent, peer.addr).await
        };
        self.no_longer_half_open(&torrent, peer.addr);
        match result {
            Ok(Some((handshaken, network))) => {
                if let Err(err) = self
                    .run_handshook_conn(&torrent, handshaken, true, peer.addr, network)
                    .await
                {
                    debug!(addr = %peer.addr, "outgoing connection error: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => {
                debug!(addr = %peer.addr, "error establishing outgoing connection: {err}");
            }
        }
    }

    /// The encryption fallback ladder: dial and handshake with the
    /// preferred header mode, then once more with the other mode unless
    /// encryption is forced. Returns `Ok(None)` when no connection could
    /// be made for valid reasons.
    async fn establish_outgoing_conn(
        self: &Arc<Self>,
        torrent: &Arc<TorrentInner>,
        addr: SocketAddr,
    ) -> Result<Option<(Handshaken, Network)>, HandshakeError> {
        let dial_timeout = torrent.dial_timeout();
        let policy = self.config.encryption_policy;
        let obfuscate_first = !policy.prefer_plaintext();

        match self
            .attempt_outgoing(torrent, addr, obfuscate_first, dial_timeout)
            .await
        {
            Ok(Some(established)) => return Ok(Some(established)),
            Ok(None) => return Ok(None),
            Err(err) => {
                if policy.force() {
                    // The obfuscated attempt was the only one allowed.
                    return Err(err);
                }
                debug!(%addr, "handshake failed, retrying with fallback header mode: {err}");
            }
        }
        self.attempt_outgoing(torrent, addr, !obfuscate_first, dial_timeout)
            .await
    }

    async fn attempt_outgoing(
        self: &Arc<Self>,
        torrent: &Arc<TorrentInner>,
        addr: SocketAddr,
        obfuscate: bool,
        dial_timeout: Duration,
    ) -> Result<Option<(Handshaken, Network)>, HandshakeError> {
        let race = dial_first(
            &self.transports,
            &self.conn_tracker,
            &self.closed,
            addr,
            |network| network.peer_enabled(&self.config),
        );
        let dialed = match timeout(dial_timeout, race).await {
            Ok(Some(dialed)) => dialed,
            _ => {
                self.stats.bump(&self.stats.unsuccessful_dials);
                return Ok(None);
            }
        };
        self.stats.bump(&self.stats.successful_dials);

        let handshaken = match timeout(
            self.config.handshakes_timeout,
            handshake::initiate(
                dialed.stream,
                torrent.info_hash,
                self.peer_id,
                self.extension_bits,
                self.config.encryption_policy,
                obfuscate,
            ),
        )
        .await
        {
            Ok(Ok(handshaken)) => handshaken,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(HandshakeError::Peer(PeerError::Timeout)),
        };
        Ok(Some((handshaken, dialed.network)))
    }

    /// One accept loop per peer-enabled transport. Parks while no
    /// torrent wants connections; every accepted stream passes the
    /// admission gate under the read lock before any handshake work.
    async fn accept_loop(self: Arc<Self>, transport: Arc<dyn Transport>) {
        loop {
            self.wait_accept().await;
            if self.closed.is_set() {
                return;
            }
            let accepted = tokio::select! {
                _ = self.closed.wait() => return,
                accepted = transport.accept() => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    debug!("error accepting connection: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let reject = {
                let state = self.state.read();
                state.admission.reject_accepted(remote, &self.config)
            };
            if self.closed.is_set() {
                return;
            }
            if reject {
                self.stats.bump(&self.stats.rejected_accepts);
                debug!(%remote, "rejecting accepted connection");
                continue;
            }
            self.stats.bump(&self.stats.accepted_conns);
            debug!(
                network = transport.network().as_str(),
                %remote,
                "accepted connection"
            );
            let this = Arc::clone(&self);
            let network = transport.network();
            tokio::spawn(async move { this.incoming_connection(stream, remote, network).await });
        }
    }

    async fn wait_accept(&self) {
        loop {
            let notified = self.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.closed.is_set() {
                return;
            }
            if self.wants_conns() {
                return;
            }
            notified.await;
        }
    }

    fn wants_conns(&self) -> bool {
        let state = self.state.read();
        state.torrents.values().any(|torrent| {
            let ts = torrent.state.lock();
            !ts.closed && ts.networking_enabled
        })
    }

    /// Receiver-side handshakes and connection startup for one accepted
    /// stream.
    async fn incoming_connection(
        self: Arc<Self>,
        stream: PeerStream,
        remote: SocketAddr,
        network: Network,
    ) {
        let skeys = self.skeys();
        let result = timeout(
            self.config.handshakes_timeout,
            handshake::receive(
                stream,
                skeys,
                self.config.encryption_policy,
                self.peer_id,
                self.extension_bits,
            ),
        )
        .await;
        let handshaken = match result {
            Ok(Ok(handshaken)) => handshaken,
            Ok(Err(err)) => {
                debug!(%remote, "error receiving handshakes: {err}");
                self.stats.bump(&self.stats.bad_handshakes);
                self.on_bad_accept(remote);
                return;
            }
            Err(_) => {
                debug!(%remote, "handshakes timed out");
                self.stats.bump(&self.stats.bad_handshakes);
                self.on_bad_accept(remote);
                return;
            }
        };
        let torrent = self.state.read().torrents.get(&handshaken.info_hash).cloned();
        let Some(torrent) = torrent else {
            debug!(%remote, "received handshake for unloaded torrent");
            self.stats.bump(&self.stats.unknown_info_hash_accepts);
            self.on_bad_accept(remote);
            return;
        };
        if let Err(err) = self
            .run_handshook_conn(&torrent, handshaken, false, remote, network)
            .await
        {
            debug!(%remote, "received connection error: {err}");
        }
    }

    fn on_bad_accept(&self, remote: SocketAddr) {
        self.state.write().admission.on_bad_accept(remote);
    }

    /// Takes a fully-handshaken stream through doppelganger and
    /// registration checks, then runs it until it dies.
    async fn run_handshook_conn(
        self: &Arc<Self>,
        torrent: &Arc<TorrentInner>,
        handshaken: Handshaken,
        outgoing: bool,
        remote: SocketAddr,
        network: Network,
    ) -> Result<(), PeerError> {
        if handshaken.peer_id == self.peer_id {
            self.stats.bump(&self.stats.conns_to_self);
            if outgoing {
                // The remote listen address is not necessarily its
                // dialing address, so only the initiator records the
                // doppelganger.
                self.state
                    .write()
                    .admission
                    .add_doppelganger(remote.to_string());
            }
            debug!(%remote, "local and remote peer ids are the same");
            return Ok(());
        }
        if self.closed.is_set() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(PeerConn {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            outgoing,
            remote,
            network,
            crypto: handshaken.crypto,
            peer_id: handshaken.peer_id,
            peer_extensions: handshaken.peer_extensions,
            flags: Default::default(),
            ext: Default::default(),
            sent_haves: Default::default(),
            stats: Default::default(),
            tx,
            closed: Latch::new(),
        });
        if let Err(reason) = torrent.add_connection(&conn) {
            debug!(%remote, "not adding connection: {reason}");
            return Ok(());
        }
        self.stats.bump(&self.stats.completed_handshakes);

        let result = run_connection(
            Arc::clone(self),
            Arc::clone(torrent),
            Arc::clone(&conn),
            handshaken.stream,
            rx,
        )
        .await;
        self.drop_connection(torrent, &conn);
        result
    }

    fn drop_connection(self: &Arc<Self>, torrent: &Arc<TorrentInner>, conn: &Arc<PeerConn>) {
        conn.close();
        torrent.remove_connection(conn.id);
        self.open_new_conns(torrent);
        self.broadcast();
    }

    async fn accept_limit_clearer(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.closed.wait() => return,
                _ = tokio::time::sleep(ACCEPT_LIMIT_CLEAR_INTERVAL) => {
                    self.state.write().admission.clear_accept_limits();
                }
            }
        }
    }

    /// Periodic announce of one torrent on one DHT server; discovered
    /// peers feed the candidate set.
    async fn dht_announcer(self: Arc<Self>, torrent: Arc<TorrentInner>, server: Arc<dyn DhtServer>) {
        loop {
            if self.closed.is_set() || torrent.state.lock().closed {
                return;
            }
            match server.announce(torrent.info_hash, self.local_port()).await {
                Ok(peers) => {
                    let candidates = peers
                        .into_iter()
                        .map(|addr| PeerCandidate::new(addr, PeerSource::DhtGetPeers))
                        .collect();
                    torrent.add_peers(candidates);
                }
                Err(err) => {
                    debug!(torrent = %torrent.info_hash, "dht announce failed: {err}");
                }
            }
            tokio::select! {
                _ = self.closed.wait() => return,
                _ = tokio::time::sleep(DHT_ANNOUNCE_INTERVAL) => {}
            }
        }
    }
}

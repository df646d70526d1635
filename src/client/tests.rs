use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;

use super::*;
use crate::config::{ClientConfig, EncryptionPolicy};
use crate::dht::{AnnounceHandler, DhtServer};
use crate::info_hash::InfoHash;
use crate::transport::BoxFuture;

fn test_config() -> ClientConfig {
    ClientConfig {
        listen_host: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        no_dht: true,
        handshakes_timeout: Duration::from_secs(2),
        min_dial_timeout: Duration::from_millis(200),
        nominal_dial_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

async fn offline_client(config: ClientConfig) -> Client {
    Client::with_transports(config, Vec::new()).await.unwrap()
}

/// A valid v1 info dictionary of roughly `piece_hashes * 20` bytes of
/// piece data, plus its info hash.
fn make_info(name: &str, piece_hashes: usize) -> (Bytes, InfoHash) {
    let hashes = vec![0xabu8; piece_hashes * 20];
    let mut info = Vec::new();
    info.extend_from_slice(b"d4:name");
    info.extend_from_slice(format!("{}:{}", name.len(), name).as_bytes());
    info.extend_from_slice(format!("6:pieces{}:", hashes.len()).as_bytes());
    info.extend_from_slice(&hashes);
    info.push(b'e');
    let digest: [u8; 20] = Sha1::digest(&info).into();
    (Bytes::from(info), InfoHash(digest))
}

async fn wait_for(mut predicate: impl FnMut() -> bool, what: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[derive(Default)]
struct RecordingStorage {
    info: Mutex<Option<Vec<u8>>>,
}

impl Storage for RecordingStorage {
    fn on_info_bytes(&self, _info_hash: InfoHash, info: &[u8]) {
        *self.info.lock() = Some(info.to_vec());
    }
}

#[tokio::test]
async fn add_torrent_is_idempotent_and_drop_restores() {
    let client = offline_client(test_config()).await;
    let info_hash = InfoHash([1u8; 20]);

    let (first, is_new) = client.add_torrent(info_hash).unwrap();
    assert!(is_new);
    let (second, is_new) = client.add_torrent(info_hash).unwrap();
    assert!(!is_new);
    assert!(Arc::ptr_eq(&first.inner, &second.inner));
    assert_eq!(client.torrents().len(), 1);

    client.drop_torrent(info_hash).unwrap();
    assert!(client.torrent(info_hash).is_none());
    assert!(matches!(
        client.drop_torrent(info_hash),
        Err(ClientError::NotFound)
    ));

    // Back to the pre-add state: adding again is new again.
    let (_, is_new) = client.add_torrent(info_hash).unwrap();
    assert!(is_new);
    client.close();
}

#[tokio::test]
async fn close_is_idempotent_and_wakes_wait_all() {
    let client = offline_client(test_config()).await;
    client.add_torrent(InfoHash([2u8; 20])).unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_all().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    client.close();
    client.close();
    let completed = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(!completed);

    client.closed().await;
    assert!(client.is_closed());
    assert!(matches!(
        client.add_torrent(InfoHash([3u8; 20])),
        Err(ClientError::AlreadyClosed)
    ));
}

#[tokio::test]
async fn wait_all_completes_when_every_torrent_finishes() {
    let client = offline_client(test_config()).await;
    let (info, info_hash) = make_info("complete", 2);
    let (torrent, _) = client.add_torrent(info_hash).unwrap();
    torrent.set_info_bytes(info).unwrap();
    assert_eq!(torrent.num_pieces(), Some(2));

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_all().await })
    };
    torrent.set_piece_complete(0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    torrent.set_piece_complete(1);
    let completed = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(completed);
    client.close();
}

#[tokio::test]
async fn set_info_bytes_rejects_mismatched_hash() {
    let client = offline_client(test_config()).await;
    let (info, _) = make_info("mismatch", 1);
    let (torrent, _) = client.add_torrent(InfoHash([9u8; 20])).unwrap();
    assert!(matches!(
        torrent.set_info_bytes(info),
        Err(ClientError::InfoHashMismatch)
    ));
    assert!(!torrent.have_info());
    client.close();
}

#[tokio::test]
async fn on_close_callbacks_run_once() {
    let client = offline_client(test_config()).await;
    let calls = Arc::new(Mutex::new(0usize));
    {
        let calls = Arc::clone(&calls);
        client.on_close(move || *calls.lock() += 1);
    }
    client.close();
    client.close();
    assert_eq!(*calls.lock(), 1);
}

#[tokio::test]
async fn listeners_share_a_single_port() {
    let client = Client::new(test_config()).await.unwrap();
    let port = client.local_port();
    assert_ne!(port, 0);
    for addr in client.listen_addrs() {
        assert_eq!(addr.port(), port);
    }
    client.close();
}

#[tokio::test]
async fn metadata_exchange_fills_info_from_peer() {
    // Scenario: the seeder knows the info dictionary; the leecher was
    // added by info hash alone and fetches it over BEP-9.
    let (info, info_hash) = make_info("shared", 1000); // 20 KB, two pieces
    assert!(info.len() > crate::peer::METADATA_PIECE_SIZE);

    let seeder = Client::new(test_config()).await.unwrap();
    let mut spec = TorrentSpec::new(info_hash);
    spec.info_bytes = Some(info.clone());
    spec.display_name = Some("shared".into());
    seeder.add_torrent_spec(spec).unwrap();

    let storage = Arc::new(RecordingStorage::default());
    let leecher = Client::new(test_config()).await.unwrap();
    let (torrent, _) = leecher
        .add_torrent_with_storage(info_hash, Some(storage.clone() as Arc<dyn Storage>))
        .unwrap();
    assert!(!torrent.have_info());

    let seeder_addr = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        seeder.local_port(),
    );
    torrent.add_peers(vec![PeerCandidate::new(seeder_addr, PeerSource::User)]);

    let poll_torrent = torrent.clone();
    wait_for(move || poll_torrent.have_info(), "metadata completion").await;
    assert_eq!(torrent.info_bytes().as_deref(), Some(info.as_ref()));
    assert_eq!(torrent.metadata_size(), Some(info.len() as i64));
    assert_eq!(
        storage.info.lock().as_deref(),
        Some(info.as_ref()),
        "storage collaborator receives the info bytes"
    );

    seeder.close();
    leecher.close();
}

#[tokio::test]
async fn self_connect_records_doppelganger_and_refuses_retry() {
    let client = Client::new(test_config()).await.unwrap();
    let info_hash = InfoHash([4u8; 20]);
    let (torrent, _) = client.add_torrent(info_hash).unwrap();

    let own_addr = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        client.local_port(),
    );
    torrent.add_peers(vec![PeerCandidate::new(own_addr, PeerSource::User)]);

    let inner = Arc::clone(&client.inner);
    wait_for(
        move || inner.state.read().admission.is_doppelganger(&own_addr),
        "doppelganger discovery",
    )
    .await;
    assert_eq!(torrent.num_conns(), 0);

    // A second offer of our own address dies at admission.
    torrent.add_peers(vec![PeerCandidate::new(own_addr, PeerSource::User)]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(torrent.num_conns(), 0);
    assert_eq!(torrent.num_half_open(), 0);

    client.close();
}

#[tokio::test]
async fn force_encryption_does_not_fall_back_to_plaintext() {
    // The peer only accepts plaintext framing; a forced initiator tries
    // obfuscation once and gives up.
    let (info, info_hash) = make_info("forced", 4);

    let plain_config = ClientConfig {
        encryption_policy: EncryptionPolicy::DisableEncryption,
        ..test_config()
    };
    let plain_peer = Client::new(plain_config).await.unwrap();
    let mut spec = TorrentSpec::new(info_hash);
    spec.info_bytes = Some(info);
    let (peer_torrent, _) = plain_peer.add_torrent_spec(spec).unwrap();

    let forced_config = ClientConfig {
        encryption_policy: EncryptionPolicy::ForceEncryption,
        ..test_config()
    };
    let forced = Client::new(forced_config).await.unwrap();
    let (torrent, _) = forced.add_torrent(info_hash).unwrap();

    let peer_addr = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        plain_peer.local_port(),
    );
    torrent.add_peers(vec![PeerCandidate::new(peer_addr, PeerSource::User)]);

    // The dial itself succeeds, then the obfuscated handshake dies with
    // no plaintext retry and no established connection on either side.
    let inner = Arc::clone(&forced.inner);
    wait_for(
        move || {
            inner
                .stats
                .successful_dials
                .load(std::sync::atomic::Ordering::Relaxed)
                >= 1
        },
        "dial attempt",
    )
    .await;
    let poll = torrent.clone();
    wait_for(move || poll.num_half_open() == 0, "half-open drain").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(torrent.num_conns(), 0);
    assert_eq!(peer_torrent.num_conns(), 0);
    assert_eq!(
        forced
            .inner
            .stats
            .successful_dials
            .load(std::sync::atomic::Ordering::Relaxed),
        1,
        "exactly one transport attempt, no fallback redial"
    );

    plain_peer.close();
    forced.close();
}

#[tokio::test]
async fn failed_inbound_handshakes_trip_the_accept_limiter() {
    let mut config = test_config();
    config.handshakes_timeout = Duration::from_millis(300);
    let client = Client::new(config).await.unwrap();
    client.add_torrent(InfoHash([5u8; 20])).unwrap();

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), client.local_port());

    // Garbage that is neither a BitTorrent header nor a workable MSE
    // exchange: the receiver fails and bumps the limiter for 127.0.0.0.
    {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x55u8; 700]).await.unwrap();
        stream.shutdown().await.ok();
    }

    let inner = Arc::clone(&client.inner);
    wait_for(
        move || {
            inner
                .state
                .read()
                .admission
                .rate_limit_accept(addr.ip(), &inner.config)
        },
        "accept limiter bump",
    )
    .await;

    // The next accept from the same /24 is rejected before any
    // handshake work.
    let before = client
        .inner
        .stats
        .rejected_accepts
        .load(std::sync::atomic::Ordering::Relaxed);
    let _stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let inner = Arc::clone(&client.inner);
    wait_for(
        move || {
            inner
                .stats
                .rejected_accepts
                .load(std::sync::atomic::Ordering::Relaxed)
                > before
        },
        "admission rejection",
    )
    .await;

    // Clearing the limiter (as the 15-minute sweeper would) re-admits.
    client.inner.state.write().admission.clear_accept_limits();
    assert!(!client
        .inner
        .state
        .read()
        .admission
        .rate_limit_accept(addr.ip(), &client.inner.config));

    client.close();
}

struct MockDht {
    addr: SocketAddr,
    handler: Mutex<Option<AnnounceHandler>>,
    announces: Mutex<Vec<(InfoHash, u16)>>,
    peers: Vec<SocketAddr>,
}

impl MockDht {
    fn new(peers: Vec<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            addr: "127.0.0.1:0".parse().unwrap(),
            handler: Mutex::new(None),
            announces: Mutex::new(Vec::new()),
            peers,
        })
    }

    fn announce_inbound(&self, info_hash: InfoHash, peer: SocketAddr) {
        if let Some(handler) = &*self.handler.lock() {
            handler(info_hash, peer);
        }
    }
}

impl DhtServer for MockDht {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn announce(
        &self,
        info_hash: InfoHash,
        port: u16,
    ) -> BoxFuture<'_, std::io::Result<Vec<SocketAddr>>> {
        self.announces.lock().push((info_hash, port));
        let peers = self.peers.clone();
        Box::pin(async move { Ok(peers) })
    }

    fn set_announce_handler(&self, handler: AnnounceHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn add_node(&self, _addr: SocketAddr) {}
}

#[tokio::test]
async fn dht_announce_feeds_peer_candidates() {
    let dht = MockDht::new(Vec::new());
    let config = ClientConfig {
        no_dht: false,
        dht_servers: vec![dht.clone() as Arc<dyn DhtServer>],
        ..test_config()
    };
    let client = offline_client(config).await;

    let info_hash = InfoHash([6u8; 20]);
    let (torrent, _) = client.add_torrent(info_hash).unwrap();
    // Keep the scheduler from consuming the candidates we assert on.
    torrent.set_networking_enabled(false);

    let peer: SocketAddr = "198.51.100.42:6881".parse().unwrap();
    dht.announce_inbound(info_hash, peer);
    assert_eq!(torrent.num_candidates(), 1);

    // Announces for unknown torrents are ignored.
    dht.announce_inbound(InfoHash([7u8; 20]), peer);
    assert_eq!(client.torrents().len(), 1);

    client.close();
}

#[tokio::test]
async fn periodic_dht_announcer_runs_for_new_torrents() {
    let dht = MockDht::new(Vec::new());
    let config = ClientConfig {
        no_dht: false,
        periodically_announce_torrents_to_dht: true,
        dht_servers: vec![dht.clone() as Arc<dyn DhtServer>],
        ..test_config()
    };
    let client = offline_client(config).await;

    let info_hash = InfoHash([8u8; 20]);
    client.add_torrent(info_hash).unwrap();
    wait_for(
        move || !dht.announces.lock().is_empty(),
        "periodic dht announce",
    )
    .await;

    client.close();
}

#[tokio::test]
async fn write_status_mentions_torrents() {
    let client = offline_client(test_config()).await;
    let (torrent, _) = client.add_torrent(InfoHash([0xaa; 20])).unwrap();
    torrent.set_display_name("status-test");

    let mut out = Vec::new();
    client.write_status(&mut out).unwrap();
    let status = String::from_utf8(out).unwrap();
    assert!(status.contains("Peer ID"));
    assert!(status.contains("# Torrents: 1"));
    assert!(status.contains("status-test"));
    assert!(status.contains("<missing metainfo>"));

    client.close();
}

#[tokio::test]
async fn engine_receives_forwarded_messages() {
    // Wire-level check that non-extension traffic reaches the engine
    // channel: two clients connect, then the seeder's engine stream is
    // taken and the leecher's initial Bitfield shows up in it.
    let (info, info_hash) = make_info("engine", 100);

    let a = Client::new(test_config()).await.unwrap();
    let mut spec = TorrentSpec::new(info_hash);
    spec.info_bytes = Some(info.clone());
    let (torrent_a, _) = a.add_torrent_spec(spec).unwrap();
    let mut engine_a = torrent_a.engine_messages().unwrap();
    assert!(torrent_a.engine_messages().is_none());

    let b = Client::new(test_config()).await.unwrap();
    let mut spec_b = TorrentSpec::new(info_hash);
    spec_b.info_bytes = Some(info);
    let (torrent_b, _) = b.add_torrent_spec(spec_b).unwrap();
    // Give the leecher some pieces so it sends a Bitfield.
    torrent_b.set_piece_complete(0);

    let a_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), a.local_port());
    torrent_b.add_peers(vec![PeerCandidate::new(a_addr, PeerSource::User)]);

    let message = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let message = engine_a.recv().await.expect("engine channel open");
            if let crate::peer::Message::Bitfield(_) = message.message {
                break message;
            }
        }
    })
    .await
    .expect("bitfield forwarded to engine");
    assert_ne!(message.conn_id, 0);

    a.close();
    b.close();
}

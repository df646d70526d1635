//! An established peer connection: its state record, the single writer
//! task, and the reader main loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tracing::debug;

use super::core::ClientInner;
use super::latch::Latch;
use super::torrent::{EngineMessage, TorrentInner};
use crate::mse::CryptoMethod;
use crate::peer::{
    Bitfield, ExtendedHandshake, ExtensionBits, Message, PeerError, PeerId,
    EXTENSION_HANDSHAKE_ID, MAX_MESSAGE_SIZE, UT_METADATA_ID,
};
use crate::transport::{Network, PeerStream};

/// Keep-alive cadence on the writer task.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// A connection that stays silent this long is torn down.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Choke and interest state, both directions. We start out choking and
/// uninterested, as does the peer.
pub(crate) struct ConnFlags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ConnFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct ConnStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    messages_read: AtomicU64,
    useful_chunks: AtomicU64,
}

impl ConnStats {
    pub fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
        self.messages_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_useful_chunk(&self) {
        self.useful_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn useful_chunks(&self) -> u64 {
        self.useful_chunks.load(Ordering::Relaxed)
    }
}

/// Extension-protocol state learned from the peer.
#[derive(Default)]
pub(crate) struct ConnExtState {
    pub peer_handshake: Option<ExtendedHandshake>,
    /// Pending flag per metadata piece, deduplicating requests.
    pub metadata_requested: Vec<bool>,
}

/// One established peer link. Lifecycle is one-way: created after the
/// handshakes, registered with its torrent, closed exactly once.
pub(crate) struct PeerConn {
    pub id: u64,
    pub outgoing: bool,
    pub remote: SocketAddr,
    pub network: Network,
    pub crypto: CryptoMethod,
    pub peer_id: PeerId,
    pub peer_extensions: ExtensionBits,
    pub flags: Mutex<ConnFlags>,
    pub ext: Mutex<ConnExtState>,
    pub sent_haves: Mutex<Option<Bitfield>>,
    pub stats: ConnStats,
    pub tx: UnboundedSender<Message>,
    pub closed: Latch,
}

impl PeerConn {
    /// Queues a message on the writer task. Send order is preserved;
    /// returns false once the writer is gone.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn close(&self) {
        self.closed.set();
    }

    /// The message id the peer assigned to ut_metadata, if it advertises
    /// the extension.
    pub fn peer_ut_metadata_id(&self) -> Option<u8> {
        self.ext
            .lock()
            .peer_handshake
            .as_ref()
            .and_then(|hs| hs.extension_id("ut_metadata"))
    }

    /// Ranking used when the connection table is at capacity: proven
    /// usefulness first, then encrypted over plaintext.
    pub fn score(&self) -> (u64, bool) {
        (
            self.stats.useful_chunks(),
            self.crypto == CryptoMethod::Rc4,
        )
    }

    /// Compact flag summary for status output: direction plus the four
    /// choke/interest bits.
    pub fn status_flags(&self) -> String {
        let flags = self.flags.lock();
        let mut out = String::new();
        out.push(if self.outgoing { 'o' } else { 'a' });
        if flags.am_interested {
            out.push('i');
        }
        if flags.am_choking {
            out.push('c');
        }
        if flags.peer_interested {
            out.push('I');
        }
        if flags.peer_choking {
            out.push('C');
        }
        out
    }
}

/// Runs the connection after registration: spawns the writer, emits the
/// initial message burst, then drives the read loop until error, idle
/// timeout, or close.
pub(crate) async fn run_connection(
    client: Arc<ClientInner>,
    torrent: Arc<TorrentInner>,
    conn: Arc<PeerConn>,
    stream: PeerStream,
    rx: UnboundedReceiver<Message>,
) -> Result<(), PeerError> {
    let (read_half, write_half) = tokio::io::split(stream);

    let writer = tokio::spawn(connection_writer(Arc::clone(&conn), write_half, rx));

    send_initial_messages(&client, &torrent, &conn);

    let result = read_loop(&client, &torrent, &conn, read_half).await;

    conn.close();
    let _ = writer.await;
    result
}

async fn read_loop<R>(
    client: &Arc<ClientInner>,
    torrent: &Arc<TorrentInner>,
    conn: &Arc<PeerConn>,
    mut read_half: R,
) -> Result<(), PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(32 * 1024);
    loop {
        let frame = tokio::select! {
            _ = conn.closed.wait() => return Ok(()),
            // The idle deadline resets on every completed read.
            frame = timeout(READ_IDLE_TIMEOUT, read_frame(&mut read_half, &mut buf)) => {
                match frame {
                    Ok(frame) => frame?,
                    Err(_) => return Err(PeerError::Timeout),
                }
            }
        };
        let (message, frame_len) = frame;
        conn.stats.add_bytes_read(frame_len as u64);
        if let Some(limiter) = &client.download_limiter {
            limiter.acquire(frame_len).await;
        }
        handle_message(client, torrent, conn, message)?;
    }
}

/// Reads one length-prefixed frame.
async fn read_frame<R>(read: &mut R, buf: &mut BytesMut) -> Result<(Message, usize), PeerError>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < 4 {
        if read.read_buf(buf).await? == 0 {
            return Err(PeerError::ConnectionClosed);
        }
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(PeerError::MessageTooLarge(length));
    }
    let total = 4 + length;
    while buf.len() < total {
        if read.read_buf(buf).await? == 0 {
            return Err(PeerError::ConnectionClosed);
        }
    }
    let frame = buf.split_to(total).freeze();
    Ok((Message::decode(frame)?, total))
}

fn handle_message(
    client: &Arc<ClientInner>,
    torrent: &Arc<TorrentInner>,
    conn: &Arc<PeerConn>,
    message: Message,
) -> Result<(), PeerError> {
    match &message {
        Message::KeepAlive => return Ok(()),
        Message::Choke => conn.flags.lock().peer_choking = true,
        Message::Unchoke => conn.flags.lock().peer_choking = false,
        Message::Interested => conn.flags.lock().peer_interested = true,
        Message::NotInterested => conn.flags.lock().peer_interested = false,
        Message::Port(port) => {
            if *port != 0 {
                client.add_dht_node(SocketAddr::new(conn.remote.ip(), *port));
            }
        }
        Message::Extended { id, payload } => {
            return match *id {
                EXTENSION_HANDSHAKE_ID => {
                    let hs = ExtendedHandshake::decode(payload)?;
                    torrent.on_extended_handshake(conn, hs);
                    Ok(())
                }
                UT_METADATA_ID => torrent.on_metadata_message(conn, payload),
                other => Err(PeerError::Extension(format!(
                    "unexpected extended message id {other}"
                ))),
            };
        }
        _ => {}
    }

    // Everything that isn't extension traffic belongs to the external
    // piece/request engine.
    let engine_tx = torrent.state.lock().engine_tx.clone();
    let _ = engine_tx.send(EngineMessage {
        conn_id: conn.id,
        remote: conn.remote,
        message,
    });
    Ok(())
}

/// Single writer per connection; message order is preserved and
/// keep-alives fill any minute-long silence.
async fn connection_writer<W>(
    conn: Arc<PeerConn>,
    mut write_half: W,
    mut rx: UnboundedReceiver<Message>,
) where
    W: AsyncWrite + Unpin,
{
    let start = tokio::time::Instant::now() + KEEPALIVE_INTERVAL;
    let mut keepalive = tokio::time::interval_at(start, KEEPALIVE_INTERVAL);
    loop {
        let message = tokio::select! {
            _ = conn.closed.wait() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = keepalive.tick() => Message::KeepAlive,
        };
        let data = message.encode();
        if let Err(err) = write_half.write_all(&data).await {
            debug!(remote = %conn.remote, "write error: {err}");
            break;
        }
        if let Err(err) = write_half.flush().await {
            debug!(remote = %conn.remote, "flush error: {err}");
            break;
        }
        conn.stats.add_bytes_written(data.len() as u64);
    }
    conn.close();
    let _ = write_half.shutdown().await;
}

/// The post-handshake burst, in Transmission's order: extended handshake,
/// then a haves summary (compact forms only when Fast is mutual), then
/// our DHT port.
fn send_initial_messages(client: &Arc<ClientInner>, torrent: &Arc<TorrentInner>, conn: &PeerConn) {
    if conn.peer_extensions.supports_extended() && client.extension_bits.supports_extended() {
        let payload = client.build_extended_handshake(torrent, conn).encode();
        conn.send(Message::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload,
        });
    }

    let fast = conn.peer_extensions.supports_fast() && client.extension_bits.supports_fast();
    let pieces = torrent.state.lock().pieces.clone();
    let have_all = pieces.as_ref().is_some_and(|p| p.is_complete());
    let have_any = pieces.as_ref().is_some_and(|p| !p.is_empty());
    if fast && have_all {
        conn.send(Message::HaveAll);
        *conn.sent_haves.lock() = pieces.as_ref().map(|p| Bitfield::full(p.len()));
    } else if fast && !have_any {
        conn.send(Message::HaveNone);
        *conn.sent_haves.lock() = pieces.as_ref().map(|p| Bitfield::new(p.len()));
    } else {
        // Without Fast's compact forms a bitfield always goes out, even
        // an all-zero one before the piece bitmap exists.
        let bitfield = pieces.unwrap_or_else(|| Bitfield::new(0));
        conn.send(Message::Bitfield(bitfield.to_bytes()));
        *conn.sent_haves.lock() = Some(bitfield);
    }

    if conn.peer_extensions.supports_dht()
        && client.extension_bits.supports_dht()
        && client.have_dht_server()
    {
        conn.send(Message::Port(client.local_port()));
    }
}

//! The two-phase handshake pipeline: optional MSE obfuscation, then the
//! BitTorrent handshake. Both phases run under the caller's single
//! `handshakes_timeout` deadline.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::config::EncryptionPolicy;
use crate::info_hash::InfoHash;
use crate::mse::{self, CryptoMethod, MseError, CRYPTO_PLAINTEXT, CRYPTO_RC4};
use crate::peer::{ExtensionBits, Handshake, PeerError, PeerId, HANDSHAKE_LEN};
use crate::transport::PeerStream;

#[derive(Debug, Error)]
pub(crate) enum HandshakeError {
    #[error("mse: {0}")]
    Mse(#[from] MseError),

    #[error("{0}")]
    Peer(#[from] PeerError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("peer answered for a different info hash")]
    InfoHashMismatch,

    #[error("encryption required but connection is plaintext")]
    EncryptionRequired,
}

/// The result of a completed handshake pipeline, either direction.
pub(crate) struct Handshaken {
    pub stream: PeerStream,
    pub crypto: CryptoMethod,
    pub header_encrypted: bool,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub peer_extensions: ExtensionBits,
}

/// Initiator side. `obfuscate` is decided by the caller's fallback
/// ladder; the expected info hash must match what the peer echoes back.
pub(crate) async fn initiate(
    stream: PeerStream,
    info_hash: InfoHash,
    our_id: PeerId,
    our_extensions: ExtensionBits,
    policy: EncryptionPolicy,
    obfuscate: bool,
) -> Result<Handshaken, HandshakeError> {
    let (mut stream, crypto, header_encrypted): (PeerStream, _, _) = if obfuscate {
        let provide = if policy.force() {
            CRYPTO_RC4
        } else if policy.disabled() {
            CRYPTO_PLAINTEXT
        } else {
            CRYPTO_RC4 | CRYPTO_PLAINTEXT
        };
        let crypto_stream = mse::initiate(stream, info_hash.as_bytes(), provide).await?;
        let method = crypto_stream.method();
        (Box::new(crypto_stream), method, true)
    } else {
        (stream, CryptoMethod::Plaintext, false)
    };

    let theirs = bt_handshake(&mut stream, Some(info_hash), our_id, our_extensions).await?;
    Ok(Handshaken {
        stream,
        crypto,
        header_encrypted,
        info_hash,
        peer_id: PeerId(theirs.peer_id),
        peer_extensions: theirs.extensions,
    })
}

/// Receiver side: peek for a plaintext BitTorrent header, otherwise run
/// the MSE receiver offering every loaded info hash as a candidate key.
/// A key nonmatch falls through as plaintext; `ForceEncryption` then
/// rejects it.
pub(crate) async fn receive(
    mut stream: PeerStream,
    skeys: Vec<[u8; 20]>,
    policy: EncryptionPolicy,
    our_id: PeerId,
    our_extensions: ExtensionBits,
) -> Result<Handshaken, HandshakeError> {
    let allow_rc4 = !policy.disabled();
    let allow_plaintext = !policy.force();
    let prefer_plaintext = policy.prefer_plaintext();

    let mut crypto = CryptoMethod::Plaintext;
    let mut header_encrypted = false;

    let mut stream: PeerStream = if policy.force() {
        match mse::receive(stream, &skeys, allow_rc4, allow_plaintext, prefer_plaintext).await? {
            mse::ReceiveOutcome::Established {
                stream,
                initial_payload,
                ..
            } => {
                crypto = stream.method();
                header_encrypted = true;
                Box::new(PrefixStream::new(initial_payload, stream))
            }
            mse::ReceiveOutcome::NoKeyMatch(_) => {
                return Err(HandshakeError::EncryptionRequired);
            }
        }
    } else {
        // Peek the length of a BitTorrent protocol header; anything else
        // is taken for an MSE exchange.
        let mut head = [0u8; 20];
        stream.read_exact(&mut head).await?;
        if head[0] as usize == 19 && &head[1..] == b"BitTorrent protocol" {
            Box::new(PrefixStream::new(head.to_vec(), stream))
        } else {
            let prefixed = PrefixStream::new(head.to_vec(), stream);
            match mse::receive(prefixed, &skeys, allow_rc4, allow_plaintext, prefer_plaintext)
                .await?
            {
                mse::ReceiveOutcome::Established {
                    stream,
                    initial_payload,
                    ..
                } => {
                    crypto = stream.method();
                    header_encrypted = true;
                    Box::new(PrefixStream::new(initial_payload, stream))
                }
                mse::ReceiveOutcome::NoKeyMatch(inner) => Box::new(inner),
            }
        }
    };

    if policy.force() && !header_encrypted {
        return Err(HandshakeError::EncryptionRequired);
    }

    let theirs = bt_handshake(&mut stream, None, our_id, our_extensions).await?;
    Ok(Handshaken {
        stream,
        crypto,
        header_encrypted,
        info_hash: InfoHash(theirs.info_hash),
        peer_id: PeerId(theirs.peer_id),
        peer_extensions: theirs.extensions,
    })
}

/// The fixed-length BitTorrent handshake. With an expected info hash we
/// speak first and verify the echo; without one (receiver) we learn the
/// info hash from the peer and answer with it.
async fn bt_handshake<S>(
    stream: &mut S,
    expected: Option<InfoHash>,
    our_id: PeerId,
    our_extensions: ExtensionBits,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match expected {
        Some(info_hash) => {
            let ours = Handshake::new(our_extensions, *info_hash.as_bytes(), *our_id.as_bytes());
            stream.write_all(&ours.encode()).await?;
            stream.flush().await?;
            let theirs = read_handshake(stream).await?;
            if theirs.info_hash != *info_hash.as_bytes() {
                return Err(HandshakeError::InfoHashMismatch);
            }
            Ok(theirs)
        }
        None => {
            let theirs = read_handshake(stream).await?;
            let ours = Handshake::new(our_extensions, theirs.info_hash, *our_id.as_bytes());
            stream.write_all(&ours.encode()).await?;
            stream.flush().await?;
            Ok(theirs)
        }
    }
}

async fn read_handshake<S>(stream: &mut S) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    Ok(Handshake::decode(&buf)?)
}

/// Serves already-consumed bytes before the underlying stream; writes
/// pass straight through.
pub(crate) struct PrefixStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    stream: S,
}

impl<S> PrefixStream<S> {
    pub fn new(prefix: Vec<u8>, stream: S) -> Self {
        Self {
            prefix,
            pos: 0,
            stream,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = (this.prefix.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

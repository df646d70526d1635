//! Message Stream Encryption / Protocol Encryption (the "MSE/PE"
//! obfuscated handshake).
//!
//! Hides the BitTorrent handshake behind a Diffie-Hellman exchange and
//! optional RC4 framing. Either side may end up selecting plaintext; the
//! point of the DH dance is that a passive observer can't tell BitTorrent
//! from noise.
//!
//! The receiver does not know which torrent the initiator wants: it
//! derives `HASH('req2', info_hash)` for every loaded torrent and matches
//! against what the initiator sent. A failed match is reported as
//! [`ReceiveOutcome::NoKeyMatch`] so the caller can fall back to treating
//! the stream as plaintext.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use num_bigint::BigUint;
use num_traits::Num;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// crypto_provide / crypto_select bit for plaintext framing.
pub const CRYPTO_PLAINTEXT: u32 = 0x01;
/// crypto_provide / crypto_select bit for RC4 framing.
pub const CRYPTO_RC4: u32 = 0x02;

const DH_KEY_LEN: usize = 96;
const DH_PRIVATE_LEN: usize = 20;
const MAX_PAD_LEN: usize = 512;
const RC4_DROP: usize = 1024;

/// The framing both sides agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoMethod {
    Plaintext,
    Rc4,
}

#[derive(Debug, Error)]
pub enum MseError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to synchronize on verification constant")]
    VcSyncFailed,

    #[error("failed to synchronize on req1 hash")]
    Req1SyncFailed,

    #[error("verification constant mismatch")]
    BadVc,

    #[error("pad length {0} exceeds protocol limit")]
    PadTooLarge(usize),

    #[error("no mutually acceptable crypto method (offered {0:#x})")]
    NoCompatibleCrypto(u32),

    #[error("peer selected unacceptable crypto method {0:#x}")]
    BadSelection(u32),
}

/// Result of the receiver-side handshake.
pub enum ReceiveOutcome<S> {
    /// The handshake completed; the stream is ready for the BitTorrent
    /// handshake, and `initial_payload` holds any bytes the initiator
    /// bundled into the crypto handshake.
    Established {
        stream: CryptoStream<S>,
        info_hash: [u8; 20],
        initial_payload: Vec<u8>,
    },
    /// The initiator's req2 hash matched none of our loaded torrents.
    /// Not an error: the caller treats the stream as plaintext.
    NoKeyMatch(S),
}

/// Runs the initiator side. `crypto_provide` is the bitmask of framings
/// we offer; the BitTorrent handshake is sent afterwards through the
/// returned stream.
pub async fn initiate<S>(
    mut stream: S,
    info_hash: &[u8; 20],
    crypto_provide: u32,
) -> Result<CryptoStream<S>, MseError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (private, public) = dh_generate();
    stream.write_all(&to_fixed_bytes(&public, DH_KEY_LEN)).await?;
    stream.flush().await?;

    let mut peer_public = [0u8; DH_KEY_LEN];
    stream.read_exact(&mut peer_public).await?;
    let shared = BigUint::from_bytes_be(&peer_public).modpow(&private, &dh_prime());
    let secret = to_fixed_bytes(&shared, DH_KEY_LEN);

    let req1 = sha1_concat(b"req1", &secret);
    let req2 = sha1_concat(b"req2", info_hash);
    let req3 = sha1_concat(b"req3", &secret);
    let xor = xor20(&req2, &req3);

    let (enc_key, dec_key) = derive_keys(&secret, info_hash, true);
    let mut enc = Rc4::new(&enc_key);
    enc.discard(RC4_DROP);

    // VC + crypto_provide + len(PadC)=0 + len(IA)=0, all RC4-encrypted.
    let mut payload = Vec::with_capacity(16);
    payload.extend_from_slice(&[0u8; 8]);
    payload.extend_from_slice(&crypto_provide.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    enc.apply(&mut payload);

    stream.write_all(&req1).await?;
    stream.write_all(&xor).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;

    // The peer may precede its reply with PadB, so scan for the
    // encrypted verification constant.
    let vc_pattern = {
        let mut vc = [0u8; 8];
        let mut preview = Rc4::new(&dec_key);
        preview.discard(RC4_DROP);
        preview.apply(&mut vc);
        vc
    };
    scan_for(&mut stream, &vc_pattern, MAX_PAD_LEN + 8)
        .await?
        .ok_or(MseError::VcSyncFailed)?;

    let mut dec = Rc4::new(&dec_key);
    dec.discard(RC4_DROP + 8);

    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await?;
    dec.apply(&mut header);
    let crypto_select = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let pad_d_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    if pad_d_len > MAX_PAD_LEN {
        return Err(MseError::PadTooLarge(pad_d_len));
    }
    if pad_d_len > 0 {
        let mut pad = vec![0u8; pad_d_len];
        stream.read_exact(&mut pad).await?;
        dec.apply(&mut pad);
    }

    if crypto_select & crypto_provide != crypto_select || crypto_select.count_ones() != 1 {
        return Err(MseError::BadSelection(crypto_select));
    }
    if crypto_select == CRYPTO_RC4 {
        Ok(CryptoStream::rc4(stream, enc, dec))
    } else {
        Ok(CryptoStream::plaintext(stream))
    }
}

/// Runs the receiver side, offering every entry of `skeys` as a candidate
/// secret key. `allow_rc4`/`allow_plaintext`/`prefer_plaintext` encode
/// the local encryption policy.
pub async fn receive<S>(
    mut stream: S,
    skeys: &[[u8; 20]],
    allow_rc4: bool,
    allow_plaintext: bool,
    prefer_plaintext: bool,
) -> Result<ReceiveOutcome<S>, MseError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut peer_public = [0u8; DH_KEY_LEN];
    stream.read_exact(&mut peer_public).await?;

    let (private, public) = dh_generate();
    stream.write_all(&to_fixed_bytes(&public, DH_KEY_LEN)).await?;
    stream.flush().await?;

    let shared = BigUint::from_bytes_be(&peer_public).modpow(&private, &dh_prime());
    let secret = to_fixed_bytes(&shared, DH_KEY_LEN);

    let req1 = sha1_concat(b"req1", &secret);
    if scan_for(&mut stream, &req1, MAX_PAD_LEN + 20).await?.is_none() {
        return Err(MseError::Req1SyncFailed);
    }

    let mut xor = [0u8; 20];
    stream.read_exact(&mut xor).await?;
    let req3 = sha1_concat(b"req3", &secret);
    let req2 = xor20(&xor, &req3);
    let info_hash = match skeys
        .iter()
        .find(|key| sha1_concat(b"req2", key.as_slice()) == req2)
    {
        Some(key) => *key,
        None => return Ok(ReceiveOutcome::NoKeyMatch(stream)),
    };

    let (dec_key, enc_key) = derive_keys(&secret, &info_hash, true);
    let mut dec = Rc4::new(&dec_key);
    dec.discard(RC4_DROP);

    let mut header = [0u8; 14];
    stream.read_exact(&mut header).await?;
    dec.apply(&mut header);
    if header[..8] != [0u8; 8] {
        return Err(MseError::BadVc);
    }
    let crypto_provide = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let pad_c_len = u16::from_be_bytes([header[12], header[13]]) as usize;
    if pad_c_len > MAX_PAD_LEN {
        return Err(MseError::PadTooLarge(pad_c_len));
    }
    if pad_c_len > 0 {
        let mut pad = vec![0u8; pad_c_len];
        stream.read_exact(&mut pad).await?;
        dec.apply(&mut pad);
    }

    let mut ia_len_buf = [0u8; 2];
    stream.read_exact(&mut ia_len_buf).await?;
    dec.apply(&mut ia_len_buf);
    let ia_len = u16::from_be_bytes(ia_len_buf) as usize;
    let mut initial_payload = vec![0u8; ia_len];
    if ia_len > 0 {
        stream.read_exact(&mut initial_payload).await?;
        dec.apply(&mut initial_payload);
    }

    let crypto_select = select_crypto(crypto_provide, allow_rc4, allow_plaintext, prefer_plaintext)
        .ok_or(MseError::NoCompatibleCrypto(crypto_provide))?;

    let mut enc = Rc4::new(&enc_key);
    enc.discard(RC4_DROP);
    let mut reply = Vec::with_capacity(14);
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(&crypto_select.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    enc.apply(&mut reply);
    stream.write_all(&reply).await?;
    stream.flush().await?;

    let stream = if crypto_select == CRYPTO_RC4 {
        CryptoStream::rc4(stream, enc, dec)
    } else {
        CryptoStream::plaintext(stream)
    };
    Ok(ReceiveOutcome::Established {
        stream,
        info_hash,
        initial_payload,
    })
}

fn select_crypto(
    provided: u32,
    allow_rc4: bool,
    allow_plaintext: bool,
    prefer_plaintext: bool,
) -> Option<u32> {
    let rc4 = allow_rc4 && provided & CRYPTO_RC4 != 0;
    let plaintext = allow_plaintext && provided & CRYPTO_PLAINTEXT != 0;
    match (prefer_plaintext, plaintext, rc4) {
        (true, true, _) => Some(CRYPTO_PLAINTEXT),
        (_, _, true) => Some(CRYPTO_RC4),
        (_, true, _) => Some(CRYPTO_PLAINTEXT),
        _ => None,
    }
}

/// Reads byte-at-a-time until the trailing bytes match `pattern`, giving
/// up after `max` bytes of preceding padding.
async fn scan_for<S>(stream: &mut S, pattern: &[u8], max: usize) -> Result<Option<()>, MseError>
where
    S: AsyncRead + Unpin,
{
    let mut window = Vec::with_capacity(pattern.len() + 1);
    let mut total = 0usize;
    loop {
        let byte = stream.read_u8().await?;
        total += 1;
        window.push(byte);
        if window.len() > pattern.len() {
            window.remove(0);
        }
        if window == pattern {
            return Ok(Some(()));
        }
        if total > max {
            return Ok(None);
        }
    }
}

fn sha1_concat(prefix: &[u8], data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(prefix);
    hasher.update(data);
    hasher.finalize().into()
}

fn xor20(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Derives the two RC4 keys. `keyA` encrypts initiator-to-receiver
/// traffic, `keyB` the reverse; the returned order is (our encrypt key,
/// our decrypt key) for the initiator.
fn derive_keys(secret: &[u8], info_hash: &[u8; 20], initiator: bool) -> ([u8; 20], [u8; 20]) {
    let mut hasher = Sha1::new();
    hasher.update(b"keyA");
    hasher.update(secret);
    hasher.update(info_hash);
    let key_a: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(b"keyB");
    hasher.update(secret);
    hasher.update(info_hash);
    let key_b: [u8; 20] = hasher.finalize().into();

    if initiator {
        (key_a, key_b)
    } else {
        (key_b, key_a)
    }
}

fn dh_generate() -> (BigUint, BigUint) {
    let mut private_bytes = [0u8; DH_PRIVATE_LEN];
    rand::rng().fill(&mut private_bytes[..]);
    let private = BigUint::from_bytes_be(&private_bytes);
    let public = BigUint::from(2u8).modpow(&private, &dh_prime());
    (private, public)
}

fn to_fixed_bytes(value: &BigUint, len: usize) -> Vec<u8> {
    let mut bytes = value.to_bytes_be();
    if bytes.len() > len {
        bytes.drain(..bytes.len() - len);
    } else if bytes.len() < len {
        let mut padded = vec![0u8; len - bytes.len()];
        padded.extend_from_slice(&bytes);
        return padded;
    }
    bytes
}

// The 768-bit MSE group prime, generator 2.
fn dh_prime() -> BigUint {
    let hex = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF";
    BigUint::from_str_radix(hex, 16).expect("constant prime parses")
}

struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, slot) in s.iter_mut().enumerate() {
            *slot = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256usize {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let idx = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
            *byte ^= self.s[idx as usize];
        }
    }

    fn discard(&mut self, count: usize) {
        let mut sink = vec![0u8; count];
        self.apply(&mut sink);
    }
}

/// A byte stream with the agreed MSE framing applied: either transparent
/// plaintext or RC4 in both directions.
pub struct CryptoStream<S> {
    stream: S,
    ciphers: Option<(Rc4, Rc4)>,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> CryptoStream<S> {
    fn plaintext(stream: S) -> Self {
        Self {
            stream,
            ciphers: None,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    fn rc4(stream: S, enc: Rc4, dec: Rc4) -> Self {
        Self {
            stream,
            ciphers: Some((enc, dec)),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Wraps a stream that never saw an MSE handshake.
    pub fn passthrough(stream: S) -> Self {
        Self::plaintext(stream)
    }

    pub fn method(&self) -> CryptoMethod {
        if self.ciphers.is_some() {
            CryptoMethod::Rc4
        } else {
            CryptoMethod::Plaintext
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> CryptoStream<S> {
    fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.stream).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for CryptoStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.stream).poll_read(cx, buf))?;
        if let Some((_, dec)) = &mut this.ciphers {
            dec.apply(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for CryptoStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.ciphers.is_none() {
            return Pin::new(&mut this.stream).poll_write(cx, buf);
        }
        // Finish the previous chunk before accepting a new one; the
        // cipher state has already advanced over the pending bytes.
        ready!(this.poll_flush_pending(cx))?;
        let mut data = buf.to_vec();
        if let Some((enc, _)) = &mut this.ciphers {
            enc.apply(&mut data);
        }
        this.pending = data;
        this.pending_pos = 0;
        if let Poll::Ready(Err(err)) = this.poll_flush_pending(cx) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_pending(cx))?;
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_pending(cx))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_is_mirrored() {
        let secret = [3u8; DH_KEY_LEN];
        let info_hash = [9u8; 20];
        let (i_enc, i_dec) = derive_keys(&secret, &info_hash, true);
        let (r_enc, r_dec) = derive_keys(&secret, &info_hash, false);
        assert_eq!(i_enc, r_dec);
        assert_eq!(i_dec, r_enc);
    }

    #[test]
    fn to_fixed_bytes_pads_and_truncates() {
        let small = BigUint::from(0x1234u32);
        assert_eq!(to_fixed_bytes(&small, 4), vec![0x00, 0x00, 0x12, 0x34]);
        let large = BigUint::from(0x11223344u32);
        assert_eq!(to_fixed_bytes(&large, 3), vec![0x22, 0x33, 0x44]);
    }

    #[test]
    fn rc4_round_trips() {
        let mut enc = Rc4::new(b"key");
        let mut dec = Rc4::new(b"key");
        let mut data = b"hello world".to_vec();
        enc.apply(&mut data);
        assert_ne!(&data, b"hello world");
        dec.apply(&mut data);
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn crypto_selection_respects_policy() {
        let both = CRYPTO_RC4 | CRYPTO_PLAINTEXT;
        assert_eq!(select_crypto(both, true, true, false), Some(CRYPTO_RC4));
        assert_eq!(
            select_crypto(both, true, true, true),
            Some(CRYPTO_PLAINTEXT)
        );
        assert_eq!(
            select_crypto(CRYPTO_PLAINTEXT, true, true, false),
            Some(CRYPTO_PLAINTEXT)
        );
        // Force-encryption receiver: plaintext offers are unacceptable.
        assert_eq!(select_crypto(CRYPTO_PLAINTEXT, true, false, false), None);
        // Disable-encryption receiver never picks RC4.
        assert_eq!(select_crypto(CRYPTO_RC4, false, true, false), None);
    }

    #[tokio::test]
    async fn handshake_agrees_on_rc4_over_loopback() {
        let info_hash = [5u8; 20];
        let (client_end, server_end) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            match receive(server_end, &[info_hash], true, true, false)
                .await
                .unwrap()
            {
                ReceiveOutcome::Established {
                    mut stream,
                    info_hash: matched,
                    initial_payload,
                } => {
                    assert_eq!(matched, info_hash);
                    assert!(initial_payload.is_empty());
                    assert_eq!(stream.method(), CryptoMethod::Rc4);
                    stream.write_all(b"pong").await.unwrap();
                    stream.flush().await.unwrap();
                    let mut buf = [0u8; 4];
                    stream.read_exact(&mut buf).await.unwrap();
                    assert_eq!(&buf, b"ping");
                }
                ReceiveOutcome::NoKeyMatch(_) => panic!("expected key match"),
            }
        });

        let mut stream = initiate(client_end, &info_hash, CRYPTO_RC4).await.unwrap();
        assert_eq!(stream.method(), CryptoMethod::Rc4);
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn receiver_reports_unknown_info_hash() {
        let info_hash = [5u8; 20];
        let other = [6u8; 20];
        let (client_end, server_end) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            matches!(
                receive(server_end, &[other], true, true, false).await.unwrap(),
                ReceiveOutcome::NoKeyMatch(_)
            )
        });
        // The initiator errors out when the receiver abandons the
        // handshake; we only care that the receiver sees a clean miss.
        let _ = initiate(client_end, &info_hash, CRYPTO_RC4 | CRYPTO_PLAINTEXT).await;
        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn plaintext_selection_round_trips() {
        let info_hash = [7u8; 20];
        let (client_end, server_end) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            match receive(server_end, &[info_hash], true, true, true)
                .await
                .unwrap()
            {
                ReceiveOutcome::Established { mut stream, .. } => {
                    assert_eq!(stream.method(), CryptoMethod::Plaintext);
                    let mut buf = [0u8; 5];
                    stream.read_exact(&mut buf).await.unwrap();
                    assert_eq!(&buf, b"hello");
                }
                ReceiveOutcome::NoKeyMatch(_) => panic!("expected key match"),
            }
        });

        let mut stream = initiate(client_end, &info_hash, CRYPTO_RC4 | CRYPTO_PLAINTEXT)
            .await
            .unwrap();
        assert_eq!(stream.method(), CryptoMethod::Plaintext);
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        server.await.unwrap();
    }
}

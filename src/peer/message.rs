use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;
/// Upper bound on a single framed message. Anything larger is a protocol
/// violation and the connection is dropped.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 + 9;

/// The 8 reserved bytes exchanged in the handshake, naming the negotiable
/// feature set. Immutable for the lifetime of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtensionBits(pub [u8; 8]);

impl ExtensionBits {
    const EXTENDED_BYTE: usize = 5;
    const EXTENDED_BIT: u8 = 0x10;
    const DHT_BYTE: usize = 7;
    const DHT_BIT: u8 = 0x01;
    const FAST_BYTE: usize = 7;
    const FAST_BIT: u8 = 0x04;

    /// The bits this client advertises: extension protocol (BEP-10) and
    /// fast extension (BEP-6) always, DHT (BEP-5) when serving one.
    pub fn local_default(dht: bool) -> Self {
        let mut bits = Self::default();
        bits.0[Self::EXTENDED_BYTE] |= Self::EXTENDED_BIT;
        bits.0[Self::FAST_BYTE] |= Self::FAST_BIT;
        if dht {
            bits.0[Self::DHT_BYTE] |= Self::DHT_BIT;
        }
        bits
    }

    pub fn supports_extended(&self) -> bool {
        self.0[Self::EXTENDED_BYTE] & Self::EXTENDED_BIT != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.0[Self::FAST_BYTE] & Self::FAST_BIT != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.0[Self::DHT_BYTE] & Self::DHT_BIT != 0
    }
}

/// The fixed-length BitTorrent handshake header.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub extensions: ExtensionBits,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(extensions: ExtensionBits, info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            extensions,
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.extensions.0);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }
        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }
        let mut extensions = [0u8; 8];
        extensions.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        Ok(Self {
            extensions: ExtensionBits(extensions),
            info_hash,
            peer_id,
        })
    }
}

/// Message type identifiers in the peer wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            13 => Ok(MessageId::Suggest),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::Reject),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            _ => Err(PeerError::InvalidMessageId(value)),
        }
    }
}

/// A framed peer wire message: 4-byte big-endian length, then a 1-byte id
/// (except keep-alive, which is length 0) and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => Self::put_bare(&mut buf, MessageId::Choke),
            Message::Unchoke => Self::put_bare(&mut buf, MessageId::Unchoke),
            Message::Interested => Self::put_bare(&mut buf, MessageId::Interested),
            Message::NotInterested => Self::put_bare(&mut buf, MessageId::NotInterested),
            Message::Have { piece } => Self::put_u32_payload(&mut buf, MessageId::Have, *piece),
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, MessageId::Request, *index, *begin, *length),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, MessageId::Cancel, *index, *begin, *length),
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
            Message::Suggest { piece } => {
                Self::put_u32_payload(&mut buf, MessageId::Suggest, *piece)
            }
            Message::HaveAll => Self::put_bare(&mut buf, MessageId::HaveAll),
            Message::HaveNone => Self::put_bare(&mut buf, MessageId::HaveNone),
            Message::Reject {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, MessageId::Reject, *index, *begin, *length),
            Message::AllowedFast { piece } => {
                Self::put_u32_payload(&mut buf, MessageId::AllowedFast, *piece)
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    fn put_bare(buf: &mut BytesMut, id: MessageId) {
        buf.put_u32(1);
        buf.put_u8(id as u8);
    }

    fn put_u32_payload(buf: &mut BytesMut, id: MessageId, value: u32) {
        buf.put_u32(5);
        buf.put_u8(id as u8);
        buf.put_u32(value);
    }

    fn put_triple(buf: &mut BytesMut, id: MessageId, index: u32, begin: u32, length: u32) {
        buf.put_u32(13);
        buf.put_u8(id as u8);
        buf.put_u32(index);
        buf.put_u32(begin);
        buf.put_u32(length);
    }

    /// Decodes one complete frame (length prefix included).
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("frame too short".into()));
        }
        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.remaining() < length {
            return Err(PeerError::InvalidMessage("incomplete frame".into()));
        }
        let id = MessageId::try_from(data.get_u8())?;
        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => Ok(Message::Have {
                piece: Self::need_u32(&mut data)?,
            }),
            MessageId::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(length - 1))),
            MessageId::Request => {
                let (index, begin, length) = Self::need_triple(&mut data)?;
                Ok(Message::Request {
                    index,
                    begin,
                    length,
                })
            }
            MessageId::Piece => {
                if data.remaining() < 8 || length < 9 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: data.copy_to_bytes(length - 9),
                })
            }
            MessageId::Cancel => {
                let (index, begin, length) = Self::need_triple(&mut data)?;
                Ok(Message::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            MessageId::Port => {
                if data.remaining() < 2 {
                    return Err(PeerError::InvalidMessage("port too short".into()));
                }
                Ok(Message::Port(data.get_u16()))
            }
            MessageId::Suggest => Ok(Message::Suggest {
                piece: Self::need_u32(&mut data)?,
            }),
            MessageId::HaveAll => Ok(Message::HaveAll),
            MessageId::HaveNone => Ok(Message::HaveNone),
            MessageId::Reject => {
                let (index, begin, length) = Self::need_triple(&mut data)?;
                Ok(Message::Reject {
                    index,
                    begin,
                    length,
                })
            }
            MessageId::AllowedFast => Ok(Message::AllowedFast {
                piece: Self::need_u32(&mut data)?,
            }),
            MessageId::Extended => {
                if length < 2 {
                    return Err(PeerError::InvalidMessage("extended too short".into()));
                }
                let ext_id = data.get_u8();
                Ok(Message::Extended {
                    id: ext_id,
                    payload: data.copy_to_bytes(length - 2),
                })
            }
        }
    }

    fn need_u32(data: &mut Bytes) -> Result<u32, PeerError> {
        if data.remaining() < 4 {
            return Err(PeerError::InvalidMessage("payload too short".into()));
        }
        Ok(data.get_u32())
    }

    fn need_triple(data: &mut Bytes) -> Result<(u32, u32, u32), PeerError> {
        if data.remaining() < 12 {
            return Err(PeerError::InvalidMessage("payload too short".into()));
        }
        Ok((data.get_u32(), data.get_u32(), data.get_u32()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_bits_flags() {
        let bits = ExtensionBits::local_default(true);
        assert!(bits.supports_extended());
        assert!(bits.supports_fast());
        assert!(bits.supports_dht());

        let no_dht = ExtensionBits::local_default(false);
        assert!(!no_dht.supports_dht());
        assert!(no_dht.supports_extended());
    }

    #[test]
    fn handshake_round_trip() {
        let hs = Handshake::new(ExtensionBits::local_default(true), [1; 20], [2; 20]);
        let encoded = hs.encode();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);
        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(decoded.info_hash, [1; 20]);
        assert_eq!(decoded.peer_id, [2; 20]);
        assert_eq!(decoded.extensions, hs.extensions);
    }

    #[test]
    fn handshake_rejects_wrong_protocol() {
        let mut bad = Handshake::new(ExtensionBits::default(), [0; 20], [0; 20])
            .encode()
            .to_vec();
        bad[1] = b'X';
        assert!(Handshake::decode(&bad).is_err());
    }

    #[test]
    fn message_round_trips() {
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece: 42 },
            Message::Bitfield(Bytes::from_static(&[0xf0, 0x01])),
            Message::Request {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            Message::Piece {
                index: 3,
                begin: 0,
                data: Bytes::from_static(b"chunk"),
            },
            Message::Cancel {
                index: 1,
                begin: 0,
                length: 16384,
            },
            Message::Port(6881),
            Message::Suggest { piece: 7 },
            Message::HaveAll,
            Message::HaveNone,
            Message::Reject {
                index: 2,
                begin: 0,
                length: 16384,
            },
            Message::AllowedFast { piece: 9 },
            Message::Extended {
                id: 0,
                payload: Bytes::from_static(b"d1:md11:ut_metadatai1eee"),
            },
        ];
        for msg in messages {
            let decoded = Message::decode(msg.encode()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn decode_rejects_truncated_payloads() {
        // Claims to be a Request but carries no body.
        let frame = Bytes::from_static(&[0, 0, 0, 13, 6]);
        assert!(Message::decode(frame).is_err());
    }
}

use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{decode_prefix, encode, Value};

/// Metadata pieces are fixed at 16 KiB (BEP-9); only the last piece of the
/// info dictionary may be shorter.
pub const METADATA_PIECE_SIZE: usize = 16384;

/// The `msg_type` values defined by BEP-9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMessageType {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(MetadataMessageType::Request),
            1 => Some(MetadataMessageType::Data),
            2 => Some(MetadataMessageType::Reject),
            _ => None,
        }
    }
}

/// A ut_metadata message: a small bencoded header, with the raw piece
/// bytes appended directly after the dictionary for `Data`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    pub total_size: Option<i64>,
    pub data: Option<Bytes>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: u32, total_size: i64, data: Bytes) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"msg_type"),
            Value::Integer(self.msg_type as i64),
        );
        dict.insert(
            Bytes::from_static(b"piece"),
            Value::Integer(self.piece as i64),
        );
        if let Some(total_size) = self.total_size {
            dict.insert(Bytes::from_static(b"total_size"), Value::Integer(total_size));
        }

        let mut out = encode(&Value::Dict(dict));
        if let Some(data) = &self.data {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (value, used) = decode_prefix(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("metadata header is not a dict".into()))?;

        let msg_type = dict
            .get(b"msg_type".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(MetadataMessageType::from_i64)
            .ok_or_else(|| PeerError::Extension("bad metadata msg_type".into()))?;
        let piece = dict
            .get(b"piece".as_slice())
            .and_then(|v| v.as_integer())
            .filter(|&p| (0..=u32::MAX as i64).contains(&p))
            .ok_or_else(|| PeerError::Extension("bad metadata piece".into()))?
            as u32;
        let total_size = dict
            .get(b"total_size".as_slice())
            .and_then(|v| v.as_integer());

        let data = match msg_type {
            MetadataMessageType::Data => Some(Bytes::copy_from_slice(&payload[used..])),
            _ => None,
        };

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

/// Number of 16 KiB pieces the info dictionary splits into.
pub fn metadata_piece_count(metadata_size: usize) -> usize {
    metadata_size.div_ceil(METADATA_PIECE_SIZE)
}

/// Byte length of one metadata piece; zero for out-of-range indices.
pub fn metadata_piece_size(piece: u32, total_size: usize) -> usize {
    let offset = piece as usize * METADATA_PIECE_SIZE;
    if offset >= total_size {
        0
    } else {
        (total_size - offset).min(METADATA_PIECE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let msg = MetadataMessage::request(5);
        let decoded = MetadataMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn data_carries_raw_trailer() {
        let piece = Bytes::from(vec![0xaa; 100]);
        let msg = MetadataMessage::data(1, 16484, piece.clone());
        let decoded = MetadataMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.msg_type, MetadataMessageType::Data);
        assert_eq!(decoded.total_size, Some(16484));
        assert_eq!(decoded.data, Some(piece));
    }

    #[test]
    fn reject_round_trip() {
        let msg = MetadataMessage::reject(3);
        let decoded = MetadataMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.data.is_none());
    }

    #[test]
    fn rejects_unknown_msg_type() {
        assert!(MetadataMessage::decode(b"d8:msg_typei9e5:piecei0ee").is_err());
    }

    #[test]
    fn piece_geometry() {
        assert_eq!(metadata_piece_count(0), 0);
        assert_eq!(metadata_piece_count(16384), 1);
        assert_eq!(metadata_piece_count(16385), 2);
        assert_eq!(metadata_piece_size(0, 20000), 16384);
        assert_eq!(metadata_piece_size(1, 20000), 3616);
        assert_eq!(metadata_piece_size(2, 20000), 0);
    }
}

use std::collections::BTreeMap;
use std::net::IpAddr;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{decode, encode, Value};

/// Extended message id of the handshake itself (BEP-10).
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;
/// Local message id we assign to ut_metadata (BEP-9).
pub const UT_METADATA_ID: u8 = 1;
/// Local message id we assign to ut_pex (BEP-11).
pub const UT_PEX_ID: u8 = 2;

/// The BEP-10 extended handshake dictionary.
///
/// `extensions` maps extension names to the sender's local message ids;
/// an id of zero announces that an extension was turned off.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtendedHandshake {
    pub extensions: BTreeMap<String, u8>,
    /// Client name and version ("v").
    pub client: Option<String>,
    /// How the sender sees our IP, in compact form ("yourip").
    pub your_ip: Option<IpAddr>,
    /// Request queue depth the sender will tolerate ("reqq").
    pub reqq: Option<i64>,
    /// Total size of the info dictionary, if known ("metadata_size").
    pub metadata_size: Option<i64>,
    /// Whether the sender prefers encrypted connections ("e").
    pub encryption: bool,
    /// The sender's listen port ("p").
    pub port: Option<u16>,
    /// The sender's public addresses ("ipv4"/"ipv6").
    pub ipv4: Option<[u8; 4]>,
    pub ipv6: Option<[u8; 16]>,
}

impl ExtendedHandshake {
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied().filter(|&id| id != 0)
    }

    pub fn encode(&self) -> Bytes {
        let mut dict = BTreeMap::new();

        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(
                Bytes::copy_from_slice(name.as_bytes()),
                Value::Integer(*id as i64),
            );
        }
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));

        if let Some(client) = &self.client {
            dict.insert(Bytes::from_static(b"v"), Value::string(client));
        }
        if let Some(ip) = self.your_ip {
            dict.insert(Bytes::from_static(b"yourip"), compact_ip(ip));
        }
        if let Some(reqq) = self.reqq {
            dict.insert(Bytes::from_static(b"reqq"), Value::Integer(reqq));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(Bytes::from_static(b"metadata_size"), Value::Integer(size));
        }
        if self.encryption {
            dict.insert(Bytes::from_static(b"e"), Value::Integer(1));
        }
        if let Some(port) = self.port {
            dict.insert(Bytes::from_static(b"p"), Value::Integer(port as i64));
        }
        if let Some(ip) = self.ipv4 {
            dict.insert(
                Bytes::from_static(b"ipv4"),
                Value::Bytes(Bytes::copy_from_slice(&ip)),
            );
        }
        if let Some(ip) = self.ipv6 {
            dict.insert(
                Bytes::from_static(b"ipv6"),
                Value::Bytes(Bytes::copy_from_slice(&ip)),
            );
        }

        Bytes::from(encode(&Value::Dict(dict)))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("extended handshake is not a dict".into()))?;

        let mut hs = Self::default();

        if let Some(m) = dict.get(b"m".as_slice()).and_then(|v| v.as_dict()) {
            for (key, val) in m {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(key), val.as_integer()) {
                    if (0..=u8::MAX as i64).contains(&id) {
                        hs.extensions.insert(name.to_string(), id as u8);
                    }
                }
            }
        }

        hs.client = dict
            .get(b"v".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);
        hs.your_ip = dict
            .get(b"yourip".as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(|b| parse_compact_ip(b));
        hs.reqq = dict.get(b"reqq".as_slice()).and_then(|v| v.as_integer());
        hs.metadata_size = dict
            .get(b"metadata_size".as_slice())
            .and_then(|v| v.as_integer())
            .filter(|&size| size >= 0);
        hs.encryption = dict
            .get(b"e".as_slice())
            .and_then(|v| v.as_integer())
            .unwrap_or(0)
            != 0;
        hs.port = dict
            .get(b"p".as_slice())
            .and_then(|v| v.as_integer())
            .filter(|&p| (1..=u16::MAX as i64).contains(&p))
            .map(|p| p as u16);
        hs.ipv4 = dict
            .get(b"ipv4".as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(|b| <[u8; 4]>::try_from(b.as_ref()).ok());
        hs.ipv6 = dict
            .get(b"ipv6".as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(|b| <[u8; 16]>::try_from(b.as_ref()).ok());

        Ok(hs)
    }
}

fn compact_ip(ip: IpAddr) -> Value {
    match ip {
        IpAddr::V4(v4) => Value::Bytes(Bytes::copy_from_slice(&v4.octets())),
        IpAddr::V6(v6) => Value::Bytes(Bytes::copy_from_slice(&v6.octets())),
    }
}

fn parse_compact_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::from(b)),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::from(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn round_trips_all_fields() {
        let mut hs = ExtendedHandshake {
            client: Some("riptide 0.1.0".into()),
            your_ip: Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))),
            reqq: Some(64),
            metadata_size: Some(32768),
            encryption: true,
            port: Some(6881),
            ipv4: Some([192, 0, 2, 1]),
            ipv6: Some([0; 16]),
            ..Default::default()
        };
        hs.extensions.insert("ut_metadata".into(), UT_METADATA_ID);
        hs.extensions.insert("ut_pex".into(), UT_PEX_ID);

        let decoded = ExtendedHandshake::decode(&hs.encode()).unwrap();
        assert_eq!(decoded, hs);
        assert_eq!(decoded.extension_id("ut_metadata"), Some(UT_METADATA_ID));
    }

    #[test]
    fn zero_extension_id_means_disabled() {
        let mut hs = ExtendedHandshake::default();
        hs.extensions.insert("ut_pex".into(), 0);
        let decoded = ExtendedHandshake::decode(&hs.encode()).unwrap();
        assert_eq!(decoded.extension_id("ut_pex"), None);
    }

    #[test]
    fn tolerates_minimal_dict() {
        let decoded = ExtendedHandshake::decode(b"de").unwrap();
        assert!(decoded.extensions.is_empty());
        assert_eq!(decoded.metadata_size, None);
        assert!(!decoded.encryption);
    }

    #[test]
    fn rejects_non_dict_payload() {
        assert!(ExtendedHandshake::decode(b"i1e").is_err());
        assert!(ExtendedHandshake::decode(b"garbage").is_err());
    }
}

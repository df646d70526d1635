use std::fmt;

use rand::Rng as _;

/// Default Azureus-style client prefix, overridable via
/// [`ClientConfig::bep20`](crate::config::ClientConfig).
pub const DEFAULT_BEP20_PREFIX: &[u8] = b"-RP0001-";

/// 20-byte peer identity, fixed for the lifetime of a client.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates an id from a BEP-20 prefix; the remainder is random.
    /// Prefixes longer than 20 bytes are truncated.
    pub fn generate(prefix: &[u8]) -> Self {
        let mut id = [0u8; 20];
        let n = prefix.len().min(20);
        id[..n].copy_from_slice(&prefix[..n]);
        rand::rng().fill(&mut id[n..]);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The client identifier between the dashes of an Azureus-style id.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(client) = self.client_id() {
            write!(f, "PeerId({client})")
        } else {
            write!(f, "PeerId({:02x?})", &self.0[..8])
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            if byte.is_ascii_alphanumeric() || *byte == b'-' {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "%{byte:02x}")?;
            }
        }
        Ok(())
    }
}

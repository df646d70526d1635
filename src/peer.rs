//! Peer wire protocol types (BEP-3, BEP-6, BEP-9, BEP-10, BEP-40).
//!
//! Pure data: handshakes, framed messages, the extended-handshake
//! dictionary, metadata-exchange payloads, and the canonical peer
//! priority. All I/O lives in the client module.

mod bitfield;
mod error;
mod extension;
mod message;
mod metadata;
mod peer_id;
mod priority;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use extension::{ExtendedHandshake, EXTENSION_HANDSHAKE_ID, UT_METADATA_ID, UT_PEX_ID};
pub use message::{ExtensionBits, Handshake, Message, MessageId, HANDSHAKE_LEN, MAX_MESSAGE_SIZE};
pub use metadata::{
    metadata_piece_count, metadata_piece_size, MetadataMessage, MetadataMessageType,
    METADATA_PIECE_SIZE,
};
pub use peer_id::{PeerId, DEFAULT_BEP20_PREFIX};
pub use priority::bep40_priority;

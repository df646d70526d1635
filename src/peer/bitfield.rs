use bytes::Bytes;

/// A piece bitmap: one bit per piece, numbered from the high bit of the
/// first byte, spare bits in the last byte kept zero.
///
/// Used both for a torrent's completed pieces and for the haves a
/// connection has announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    pieces: usize,
}

impl Bitfield {
    pub fn new(pieces: usize) -> Self {
        Self {
            bits: vec![0; pieces.div_ceil(8)],
            pieces,
        }
    }

    pub fn full(pieces: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xff; pieces.div_ceil(8)],
            pieces,
        };
        bf.mask_spare_bits();
        bf
    }

    /// Interprets a wire bitfield. Short inputs are zero-extended; spare
    /// bits are masked off.
    pub fn from_bytes(bytes: &[u8], pieces: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(pieces.div_ceil(8), 0);
        let mut bf = Self { bits, pieces };
        bf.mask_spare_bits();
        bf
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.pieces {
            return false;
        }
        self.bits[index / 8] >> (7 - index % 8) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.pieces {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.pieces
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn len(&self) -> usize {
        self.pieces
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn mask_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.pieces;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
    }
}

//! Message block format
//!
//! A logical message is `size + 1` contiguous 32-byte blocks. Only the
//! first block's header is meaningful to the transport; continuation
//! blocks are opaque payload that reuses the same layout.

/// Size of one block in bytes
pub const BLK_SIZE: usize = 32;

/// log2 of [`BLK_SIZE`]
pub const BLK_SZ_SHIFT: u32 = 5;

/// Words in one block
pub const BLK_WORDS: usize = BLK_SIZE / 4;

/// Argument words carried by a block
pub const BLK_ARGS: usize = 4;

const Q_MASK: u32 = 0xF;
const MSG_ID_SHIFT: u32 = 4;
const MSG_ID_MASK: u32 = 0xFFF;

/// Message id reserved for one-way host to card messages
pub const SIMPLEX_MSG_ID: u16 = 0;

/// One transport block
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgBlock {
    /// Function id of the message
    pub function_id: u32,
    /// Number of additional blocks that follow
    pub size: u32,
    /// Queue number (bits 0..4) and message id (bits 4..16)
    pub trans_id: u32,
    /// Opaque context from the application
    pub context_id: u32,
    /// Function specific arguments
    pub args: [u32; BLK_ARGS],
}

impl MsgBlock {
    pub fn new(function_id: u32) -> Self {
        Self {
            function_id,
            ..Default::default()
        }
    }

    /// Queue number encoded in the transport id
    pub fn queue(&self) -> u32 {
        self.trans_id & Q_MASK
    }

    pub fn set_queue(&mut self, q_num: u32) {
        self.trans_id = (self.trans_id & !Q_MASK) | (q_num & Q_MASK);
    }

    /// Message id encoded in the transport id
    pub fn msg_id(&self) -> u16 {
        ((self.trans_id >> MSG_ID_SHIFT) & MSG_ID_MASK) as u16
    }

    pub fn set_msg_id(&mut self, msg_id: u16) {
        self.trans_id = (self.trans_id & !(MSG_ID_MASK << MSG_ID_SHIFT))
            | ((msg_id as u32 & MSG_ID_MASK) << MSG_ID_SHIFT);
    }

    /// Total blocks of the message this header starts
    pub fn total_blocks(&self) -> usize {
        self.size as usize + 1
    }

    pub fn to_words(&self) -> [u32; BLK_WORDS] {
        [
            self.function_id,
            self.size,
            self.trans_id,
            self.context_id,
            self.args[0],
            self.args[1],
            self.args[2],
            self.args[3],
        ]
    }

    pub fn from_words(w: [u32; BLK_WORDS]) -> Self {
        Self {
            function_id: w[0],
            size: w[1],
            trans_id: w[2],
            context_id: w[3],
            args: [w[4], w[5], w[6], w[7]],
        }
    }

    /// Decode from the first [`BLK_SIZE`] bytes of `bytes` (little-endian)
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut w = [0u32; BLK_WORDS];
        for (word, chunk) in w.iter_mut().zip(bytes[..BLK_SIZE].chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self::from_words(w)
    }

    /// Encode into the first [`BLK_SIZE`] bytes of `out` (little-endian)
    pub fn write_bytes(&self, out: &mut [u8]) {
        for (word, chunk) in self.to_words().iter().zip(out[..BLK_SIZE].chunks_exact_mut(4)) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }
}

/// Split a flat byte run into blocks; a trailing partial block is ignored
pub fn blocks_from_bytes(bytes: &[u8]) -> Vec<MsgBlock> {
    bytes.chunks_exact(BLK_SIZE).map(MsgBlock::from_bytes).collect()
}

/// Flatten blocks into a byte run
pub fn blocks_to_bytes(blocks: &[MsgBlock]) -> Vec<u8> {
    let mut out = vec![0u8; blocks.len() * BLK_SIZE];
    for (blk, chunk) in blocks.iter().zip(out.chunks_exact_mut(BLK_SIZE)) {
        blk.write_bytes(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trans_id_fields() {
        let mut blk = MsgBlock::new(3);
        blk.set_queue(2);
        blk.set_msg_id(0xABC);
        assert_eq!(blk.trans_id, 0xABC2);
        assert_eq!(blk.queue(), 2);
        assert_eq!(blk.msg_id(), 0xABC);

        blk.set_msg_id(7);
        assert_eq!(blk.queue(), 2);
        assert_eq!(blk.msg_id(), 7);
    }

    #[test]
    fn test_trans_id_keeps_upper_bits() {
        let mut blk = MsgBlock::default();
        blk.trans_id = 0xFFFF_0000;
        blk.set_queue(1);
        blk.set_msg_id(5);
        assert_eq!(blk.trans_id, 0xFFFF_0051);
    }

    #[test]
    fn test_byte_layout() {
        let blk = MsgBlock {
            function_id: 0x0102_0304,
            size: 1,
            trans_id: 0x10,
            context_id: 9,
            args: [10, 11, 12, 13],
        };
        let bytes = blocks_to_bytes(&[blk]);
        assert_eq!(bytes.len(), BLK_SIZE);
        assert_eq!(&bytes[..4], &[4, 3, 2, 1]);
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[28], 13);
    }

    #[test]
    fn test_partial_tail_ignored() {
        let bytes = vec![0u8; BLK_SIZE * 2 + 5];
        assert_eq!(blocks_from_bytes(&bytes).len(), 2);
    }
}

use std::collections::HashMap;

/// Posible assembler errors. All of them indicate a peer sending
/// blocks we never asked for in this shape.
#[derive(Debug, PartialEq)]
pub enum AssemblerError {
    MisalignedOffset { index: u32, begin: u32 },
    WrongBlockLength { index: u32, begin: u32, length: usize },
    BlockOutOfRange { index: u32, begin: u32 },
}

/// What happened to an incoming block.
#[derive(Debug, PartialEq)]
pub enum BlockOutcome {
    /// Stored; the piece still has holes.
    Incomplete,
    /// Already had this block; payload dropped.
    Duplicate,
    /// Last hole filled: the full piece payload, ready to verify.
    Complete(Vec<u8>),
}

#[derive(Debug)]
struct PieceBuffer {
    data: Vec<u8>,
    received: Vec<bool>,
    received_count: usize,
}

/// Buffers incoming blocks per piece until the piece is whole.
///
/// Blocks may arrive out of order and duplicated (endgame sends the
/// same request to several peers). The assembler never verifies; the
/// completed buffer goes to the data descriptor for that.
#[derive(Debug)]
pub struct BlockAssembler {
    block_size: u32,
    pieces: HashMap<u32, PieceBuffer>,
}

impl BlockAssembler {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            pieces: HashMap::new(),
        }
    }

    /// Adds one received block of the given piece.
    ///
    /// `piece_size` is the full length of that piece (short for the
    /// last piece of the torrent).
    pub fn add_block(
        &mut self,
        index: u32,
        begin: u32,
        block: &[u8],
        piece_size: u32,
    ) -> Result<BlockOutcome, AssemblerError> {
        if begin % self.block_size != 0 {
            return Err(AssemblerError::MisalignedOffset { index, begin });
        }
        if begin >= piece_size {
            return Err(AssemblerError::BlockOutOfRange { index, begin });
        }

        let expected = (piece_size - begin).min(self.block_size) as usize;
        if block.len() != expected {
            return Err(AssemblerError::WrongBlockLength {
                index,
                begin,
                length: block.len(),
            });
        }

        let block_count = ((piece_size + self.block_size - 1) / self.block_size) as usize;
        let buffer = self.pieces.entry(index).or_insert_with(|| PieceBuffer {
            data: vec![0; piece_size as usize],
            received: vec![false; block_count],
            received_count: 0,
        });

        let slot = (begin / self.block_size) as usize;
        if buffer.received[slot] {
            return Ok(BlockOutcome::Duplicate);
        }

        buffer.data[begin as usize..begin as usize + block.len()].copy_from_slice(block);
        buffer.received[slot] = true;
        buffer.received_count += 1;

        if buffer.received_count == buffer.received.len() {
            if let Some(buffer) = self.pieces.remove(&index) {
                return Ok(BlockOutcome::Complete(buffer.data));
            }
        }
        Ok(BlockOutcome::Incomplete)
    }

    /// Drops the in-flight buffer of a piece (hash mismatch, abort).
    pub fn discard(&mut self, index: u32) {
        self.pieces.remove(&index);
    }

    /// Piece indices currently buffering.
    pub fn in_flight(&self) -> Vec<u32> {
        self.pieces.keys().copied().collect()
    }

    /// Block offsets of a piece still missing, for re-requesting.
    pub fn missing_blocks(&self, index: u32, piece_size: u32) -> Vec<u32> {
        let block_count = (piece_size + self.block_size - 1) / self.block_size;
        match self.pieces.get(&index) {
            None => (0..block_count).map(|slot| slot * self.block_size).collect(),
            Some(buffer) => buffer
                .received
                .iter()
                .enumerate()
                .filter(|(_, received)| !**received)
                .map(|(slot, _)| slot as u32 * self.block_size)
                .collect(),
        }
    }
}

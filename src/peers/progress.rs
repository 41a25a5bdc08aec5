use super::{BlockLength, BlockOffset, PieceIndex, PieceLength, BLOCK_SIZE};
use crate::prelude::*;
use std::cmp::min;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Requested {
    begin: BlockOffset,
    length: BlockLength,
    sent_at: Instant,
}

/// reassembly of the piece a connection has reserved. blocks are requested one at a time, in
/// order, so the buffer length is always the offset of the next block.
#[derive(Debug, Clone)]
pub(super) struct PieceDownload {
    index: PieceIndex,
    piece_length: PieceLength,
    buffer: Vec<u8>,
    requested: Option<Requested>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, piece_length: PieceLength) -> Self {
        Self {
            index,
            piece_length,
            buffer: Vec::with_capacity(piece_length as usize),
            requested: None,
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    /// the next block to ask for, if none is outstanding. records it as requested.
    pub fn next_request(&mut self) -> Option<(BlockOffset, BlockLength)> {
        if self.requested.is_some() || self.is_done() {
            return None;
        }

        let begin = self.buffer.len() as BlockOffset;
        let length = min(self.piece_length - begin, BLOCK_SIZE);
        self.requested = Some(Requested {
            begin,
            length,
            sent_at: Instant::now(),
        });

        Some((begin, length))
    }

    pub fn requested_at(&self) -> Option<Instant> {
        self.requested.map(|requested| requested.sent_at)
    }

    /// true if `block` answers the outstanding request exactly.
    pub fn expects(&self, index: u32, begin: BlockOffset, block_length: usize) -> bool {
        self.requested.is_some_and(|requested| {
            index as PieceIndex == self.index
                && requested.begin == begin
                && requested.length as usize == block_length
        })
    }

    pub fn append(&mut self, block: &[u8]) {
        trace!(index = self.index, len = block.len(), "appending block");
        self.buffer.extend_from_slice(block);
        self.requested = None;
    }

    pub fn is_done(&self) -> bool {
        self.buffer.len() == self.piece_length as usize
    }

    pub fn into_piece(self) -> (PieceIndex, Vec<u8>) {
        (self.index, self.buffer)
    }
}

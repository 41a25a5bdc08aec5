mod scheduler;
mod storage;

use crate::metainfo::TorrentMetadata;
use crate::peers::{BlockLength, BlockOffset, PieceIndex, PieceLength};
use crate::prelude::*;
use crate::torrent::{Bitfield, Bitslice};
use scheduler::PieceScheduler;
use sha1_smol::Sha1;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::bytes::Bytes;

pub use scheduler::{PieceState, Priority};
pub use storage::{locate, TorrentFiles};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("piece {0} failed hash verification")]
    Integrity(PieceIndex),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece index {0} out of range")]
    InvalidPiece(PieceIndex),

    #[error("block at {begin} of length {length} is outside piece {index}")]
    InvalidBlock {
        index: PieceIndex,
        begin: BlockOffset,
        length: BlockLength,
    },

    #[error("piece store is closed")]
    Closed,
}

#[derive(Debug)]
struct Counters {
    scheduler: PieceScheduler,
    downloaded: u64,
    downloaded_session: u64,
}

/// the single source of truth for what is downloaded and what should be fetched next.
///
/// scheduling state sits behind one mutex that is never held across an await, so selection
/// and release are atomic with respect to every connection. disk access is serialized
/// separately through the async file lock.
#[derive(Debug)]
pub struct PieceStore {
    metainfo: Arc<TorrentMetadata>,
    files: tokio::sync::Mutex<Option<TorrentFiles>>,
    state: Mutex<Counters>,
}

impl PieceStore {
    /// takes ownership of the opened files and rechecks every piece already on disk.
    #[instrument(name = "open piece store", skip_all, fields(torrent = %metainfo.name))]
    pub async fn open(
        metainfo: Arc<TorrentMetadata>,
        files: TorrentFiles,
    ) -> Result<Self, StoreError> {
        let store = Self {
            state: Mutex::new(Counters {
                scheduler: PieceScheduler::new(metainfo.piece_count()),
                downloaded: 0,
                downloaded_session: 0,
            }),
            files: tokio::sync::Mutex::new(Some(files)),
            metainfo,
        };

        store.force_recheck().await?;
        Ok(store)
    }

    /// opens (creating and sizing as needed) the files named in the metadata, then `open`s.
    pub async fn open_on_disk(metainfo: Arc<TorrentMetadata>) -> Result<Self, StoreError> {
        let files = TorrentFiles::open(&metainfo.files).await?;
        Self::open(metainfo, files).await
    }

    fn state(&self) -> MutexGuard<'_, Counters> {
        // the state is updated in single assignments, a panic elsewhere can't leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn metainfo(&self) -> &Arc<TorrentMetadata> {
        &self.metainfo
    }

    pub fn piece_count(&self) -> usize {
        self.metainfo.piece_count()
    }

    pub fn length_of_piece(&self, index: PieceIndex) -> PieceLength {
        self.metainfo.length_of_piece(index)
    }

    /// file holding the first byte of a piece and the offset of that byte within it.
    pub fn index_to_file(&self, index: PieceIndex) -> Option<(usize, u64)> {
        if index >= self.piece_count() {
            return None;
        }
        locate(&self.metainfo.files, self.metainfo.piece_offset(index))
    }

    /// rehashes every piece. meant to run before any connection holds a reservation.
    pub async fn force_recheck(&self) -> Result<(), StoreError> {
        info!("rechecking {} pieces", self.piece_count());
        {
            let mut state = self.state();
            state.scheduler = PieceScheduler::new(self.piece_count());
            state.downloaded = 0;
        }

        for index in 0..self.piece_count() {
            match self.read_piece(index).await {
                Ok(_) => trace!(index, "piece verified on disk"),
                Err(StoreError::Integrity(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let state = self.state();
        info!(
            verified = state.scheduler.verified_count(),
            downloaded = state.downloaded,
            "recheck done"
        );
        Ok(())
    }

    /// marks a piece verified and counts it, if it wasn't already.
    fn mark_verified(&self, index: PieceIndex, session: bool) {
        let length = self.length_of_piece(index) as u64;
        let mut state = self.state();
        if state.scheduler.verify(index) {
            state.downloaded += length;
            if session {
                state.downloaded_session += length;
            }
        }
    }

    fn check_index(&self, index: PieceIndex) -> Result<(), StoreError> {
        if index >= self.piece_count() {
            return Err(StoreError::InvalidPiece(index));
        }
        Ok(())
    }

    fn matches_hash(&self, index: PieceIndex, data: &[u8]) -> bool {
        Sha1::from(data).digest().bytes() == self.metainfo.piece_hashes[index]
    }

    /// reads and verifies a whole piece. a good hash marks the piece verified.
    pub async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StoreError> {
        self.check_index(index)?;
        let offset = self.metainfo.piece_offset(index);
        let length = self.length_of_piece(index) as usize;

        let data = {
            let mut files = self.files.lock().await;
            let files = files.as_mut().ok_or(StoreError::Closed)?;
            files.read_at(offset, length).await?
        };

        if !self.matches_hash(index, &data) {
            return Err(StoreError::Integrity(index));
        }
        self.mark_verified(index, false);

        Ok(Bytes::from(data))
    }

    pub async fn read_block(
        &self,
        index: PieceIndex,
        begin: BlockOffset,
        length: BlockLength,
    ) -> Result<Bytes, StoreError> {
        self.check_index(index)?;
        let end = begin as u64 + length as u64;
        if end > self.length_of_piece(index) as u64 {
            return Err(StoreError::InvalidBlock {
                index,
                begin,
                length,
            });
        }

        let piece = self.read_piece(index).await?;
        Ok(piece.slice(begin as usize..end as usize))
    }

    /// verifies and persists a downloaded piece. nothing is written if the hash is wrong.
    pub async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StoreError> {
        self.check_index(index)?;
        if !self.matches_hash(index, data) {
            warn!(index, "hash didn't match, piece discarded");
            return Err(StoreError::Integrity(index));
        }
        if self.is_verified(index) {
            debug!(index, "piece already verified, skipping write");
            return Ok(());
        }

        {
            let mut files = self.files.lock().await;
            let files = files.as_mut().ok_or(StoreError::Closed)?;
            files
                .write_at(self.metainfo.piece_offset(index), data)
                .await?;
        }
        self.mark_verified(index, true);

        debug!(index, "piece written");
        Ok(())
    }

    /// reserves the next piece to fetch from a peer that has `peer_has`.
    pub fn select_piece_for(&self, peer_has: &Bitslice) -> Option<PieceIndex> {
        self.state().scheduler.select(peer_has)
    }

    /// gives back a reservation from `select_piece_for`.
    pub fn release(&self, index: PieceIndex) {
        if self.state().scheduler.release(index) {
            debug!(index, "released piece reservation");
        }
    }

    pub fn set_priority(&self, index: PieceIndex, priority: Priority) {
        self.state().scheduler.set_priority(index, priority);
    }

    pub fn state_of(&self, index: PieceIndex) -> Option<PieceState> {
        self.state().scheduler.state(index)
    }

    pub fn is_verified(&self, index: PieceIndex) -> bool {
        self.state_of(index) == Some(PieceState::Verified)
    }

    pub fn bitfield(&self) -> Bitfield {
        self.state().scheduler.bitfield().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state().scheduler.verified_count() == self.piece_count()
    }

    pub fn downloaded(&self) -> u64 {
        self.state().downloaded
    }

    pub fn downloaded_session(&self) -> u64 {
        self.state().downloaded_session
    }

    /// verified bytes over total bytes, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        match self.metainfo.total_size {
            0 => 1.0,
            total => self.downloaded() as f64 / total as f64,
        }
    }

    /// flushes and drops every file handle; later reads and writes fail with `Closed`.
    pub async fn close(&self) -> Result<(), StoreError> {
        if let Some(files) = self.files.lock().await.take() {
            files.close().await?;
            info!("closed torrent files");
        }
        Ok(())
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        self.state().scheduler.assert_consistent();
    }
}

pub mod download_info;

use crate::bencode::{self, CodecError};
use crate::peers::{PieceIndex, PieceLength};
use crate::torrent::{InfoHash, PeerId};
use anyhow::Context;
use download_info::{DownloadInfo, Metainfo};
use std::path::{Component, Path, PathBuf};

pub type PieceHash = [u8; 20];

#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
    #[error("metainfo is not valid bencode: {0}")]
    Codec(#[from] CodecError),

    #[error("malformed metainfo: {0}")]
    Format(#[from] serde_bencode::Error),

    #[error("metainfo has no info dictionary")]
    MissingInfo,

    #[error("invalid piece length {0}")]
    InvalidPieceLength(i64),

    #[error("invalid file length {0}")]
    InvalidLength(i64),

    #[error("expected {expected} piece hashes for the content size, found {actual}")]
    PieceCountMismatch { expected: u64, actual: usize },

    #[error("unsafe file path component {0:?}")]
    UnsafePath(String),
}

/// one file of the torrent, placed at `start` in the piece-indexed byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub md5sum: Option<String>,
    pub start: u64,
}

/// everything the engine needs to know about a torrent, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    pub name: String,
    pub announce: Option<String>,
    pub announce_list: Vec<String>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    /// seconds since the unix epoch.
    pub creation_date: Option<i64>,
    pub private: bool,
    pub info_hash: InfoHash,
    pub piece_length: PieceLength,
    pub piece_hashes: Vec<PieceHash>,
    pub total_size: u64,
    pub peer_id: PeerId,
    pub files: Vec<FileEntry>,
}

impl TorrentMetadata {
    pub async fn from_file(
        path: impl AsRef<Path>,
        save_dir: impl AsRef<Path>,
        peer_id: PeerId,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read metainfo file {}", path.display()))?;

        Self::from_bytes(&bytes, save_dir, peer_id)
            .with_context(|| format!("failed to parse metainfo file {}", path.display()))
    }

    pub fn from_bytes(
        bytes: &[u8],
        save_dir: impl AsRef<Path>,
        peer_id: PeerId,
    ) -> Result<Self, MetainfoError> {
        // the typed view drops keys it doesn't know about, so the info hash is taken over the
        // info dictionary exactly as it appears in the file.
        let info_span =
            bencode::dict_value_span(bytes, b"info")?.ok_or(MetainfoError::MissingInfo)?;
        let info_hash = InfoHash::of_bencoded_info(&bytes[info_span]);

        let metainfo: Metainfo = serde_bencode::from_bytes(bytes)?;
        let save_dir = save_dir.as_ref();

        let piece_length = metainfo.info.piece_length();
        let piece_length = PieceLength::try_from(piece_length)
            .ok()
            .filter(|&len| len > 0)
            .ok_or(MetainfoError::InvalidPieceLength(piece_length))?;

        let name = metainfo.info.name().to_string();
        check_component(&name)?;

        let mut files = Vec::new();
        let mut start = 0;
        match &metainfo.info {
            DownloadInfo::SingleFile { length, md5sum, .. } => {
                let length = checked_length(*length)?;
                files.push(FileEntry {
                    path: save_dir.join(&name),
                    length,
                    md5sum: md5sum.clone(),
                    start,
                });
                start += length;
            }
            DownloadInfo::MultiFile {
                files: file_infos, ..
            } => {
                for file in file_infos {
                    let length = checked_length(file.length)?;
                    let mut path = save_dir.join(&name);
                    for component in &file.path {
                        check_component(component)?;
                        path.push(component);
                    }
                    files.push(FileEntry {
                        path,
                        length,
                        md5sum: file.md5sum.clone(),
                        start,
                    });
                    start += length;
                }
            }
        }
        let total_size = start;

        let piece_hashes = metainfo.info.pieces().to_vec();
        let expected = total_size.div_ceil(piece_length as u64);
        if expected != piece_hashes.len() as u64 {
            return Err(MetainfoError::PieceCountMismatch {
                expected,
                actual: piece_hashes.len(),
            });
        }

        Ok(Self {
            name,
            announce: metainfo.announce,
            announce_list: metainfo
                .announce_list
                .unwrap_or_default()
                .into_iter()
                .flatten()
                .collect(),
            comment: metainfo.comment,
            created_by: metainfo.created_by,
            creation_date: metainfo.creation_date,
            private: metainfo.info.is_private(),
            info_hash,
            piece_length,
            piece_hashes,
            total_size,
            peer_id,
            files,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// every piece is `piece_length` long except the last, which holds the remainder.
    pub fn length_of_piece(&self, index: PieceIndex) -> PieceLength {
        if index + 1 < self.piece_count() {
            return self.piece_length;
        }
        match (self.total_size % self.piece_length as u64) as PieceLength {
            0 => self.piece_length,
            remainder => remainder,
        }
    }

    /// offset of the first byte of a piece in the piece-indexed byte stream.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_length as u64
    }
}

fn checked_length(length: i64) -> Result<u64, MetainfoError> {
    u64::try_from(length).map_err(|_| MetainfoError::InvalidLength(length))
}

fn check_component(component: &str) -> Result<(), MetainfoError> {
    let mut components = Path::new(component).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(MetainfoError::UnsafePath(component.to_string())),
    }
}

use super::PieceHash;
use serde::Deserialize;

/// typed view of a `.torrent` file as laid out on disk.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    #[serde(default)]
    pub announce: Option<String>,

    pub info: DownloadInfo,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>, // seconds since unix epoch

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileInfo {
    pub path: Vec<String>,
    pub length: i64,

    #[serde(default)]
    pub md5sum: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DownloadInfo {
    MultiFile {
        #[serde(rename = "name")]
        dirname: String,

        files: Vec<FileInfo>,

        #[serde(rename = "piece length")]
        piece_length: i64,

        #[serde(deserialize_with = "piece_hashes_parser::deserialize")]
        pieces: Vec<PieceHash>,

        #[serde(default)]
        private: Option<i64>,
    },

    SingleFile {
        #[serde(rename = "name")]
        filename: String,
        length: i64,

        #[serde(default)]
        md5sum: Option<String>,

        #[serde(rename = "piece length")]
        piece_length: i64,

        #[serde(deserialize_with = "piece_hashes_parser::deserialize")]
        pieces: Vec<PieceHash>,

        #[serde(default)]
        private: Option<i64>,
    },
}

impl DownloadInfo {
    pub fn name(&self) -> &str {
        match self {
            Self::MultiFile { dirname, .. } => dirname,
            Self::SingleFile { filename, .. } => filename,
        }
    }

    pub fn piece_length(&self) -> i64 {
        match self {
            Self::MultiFile { piece_length, .. } | Self::SingleFile { piece_length, .. } => {
                *piece_length
            }
        }
    }

    /// BEP 27, peers must come only from the torrent's own trackers.
    pub fn is_private(&self) -> bool {
        match self {
            Self::MultiFile { private, .. } | Self::SingleFile { private, .. } => {
                *private == Some(1)
            }
        }
    }

    pub fn pieces(&self) -> &[PieceHash] {
        match self {
            Self::MultiFile { pieces, .. } | Self::SingleFile { pieces, .. } => pieces,
        }
    }
}

mod piece_hashes_parser {
    use crate::metainfo::PieceHash;
    use serde::de::{self, Visitor};
    use static_str_ops::static_format;
    const HASH_SIZE: usize = std::mem::size_of::<PieceHash>();

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<PieceHash>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_bytes(PieceHashVisitor)
    }

    struct PieceHashVisitor;
    impl<'de> Visitor<'de> for PieceHashVisitor {
        type Value = Vec<PieceHash>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str(static_format!(
                "a byte sequence whose length is a multiple of {}",
                HASH_SIZE
            ))
        }

        fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if bytes.len() % HASH_SIZE != 0 {
                return Err(E::custom(static_format!(
                    "piece hashes should be a multiple of length {}",
                    HASH_SIZE
                )));
            }

            //TODO: use array_chunks::<20> instead of chunks_exact when it becomes stable.
            let piece_hash_slices = bytes
                .chunks_exact(HASH_SIZE)
                .map(|chunk| {
                    chunk.try_into().expect(static_format!(
                        "chunks_exact returns only chunks which are length {}",
                        HASH_SIZE
                    ))
                })
                .collect();

            Ok(piece_hash_slices)
        }
    }
}

pub mod codec;
pub mod extension;
pub mod handshake;

use crate::bencode::CodecError;
use crate::piece_store::StoreError;

/// everything that can end a peer connection.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// the peer broke the wire protocol; the connection is not retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("info hash in handshake does not match ours")]
    InfoHashMismatch,

    #[error("connected to ourselves")]
    SelfConnection,

    #[error("request not answered in time")]
    Timeout,

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("piece store error: {0}")]
    Store(#[from] StoreError),

    #[error("bencode error in extension message: {0}")]
    Codec(#[from] CodecError),
}

impl PeerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

mod comms;
mod connection;
mod progress;

pub use comms::*;
pub use connection::{ConnectionContext, ConnectionState, PeerConnection};

use tokio::io::{AsyncRead, AsyncWrite};

pub type PieceIndex = usize;
pub type PieceLength = u32;
pub type BlockLength = u32;
pub type BlockOffset = u32;

/// largest block we request or serve.
pub const BLOCK_SIZE: BlockLength = 1 << 14;

/// anything a peer connection can run over, a tcp stream in practice and in-memory pipes in tests.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

use super::PieceIndex;
use crate::peer_protocol::PeerError;
use crate::torrent::PeerId;
use std::net::SocketAddr;

/// sent by the orchestrator to a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommands {
    /// we verified a piece, tell the peer.
    Have(PieceIndex),
}

/// sent by connections to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAlerts {
    PieceVerified {
        index: PieceIndex,
        from: SocketAddr,
    },
    /// the connection gave its reservation back while staying open.
    PieceReleased {
        index: PieceIndex,
        from: SocketAddr,
    },
}

/// what is left of a connection once its task ends.
#[derive(Debug)]
pub struct ClosedConnection {
    pub peer_addr: SocketAddr,
    pub peer_id: Option<PeerId>,
    /// piece still reserved by the connection, the owner of the store must release it.
    pub held_piece: Option<PieceIndex>,
    /// `None` on an orderly shutdown.
    pub error: Option<PeerError>,
}

impl ClosedConnection {
    pub fn failed(peer_addr: SocketAddr, error: PeerError) -> Self {
        Self {
            peer_addr,
            peer_id: None,
            held_piece: None,
            error: Some(error),
        }
    }
}

pub mod bencode;
pub mod config;
pub mod metainfo;
pub mod orchestrator;
pub mod peer_protocol;
pub mod peers;
pub mod piece_store;
pub mod prelude;
pub mod torrent;

pub use config::Config;
pub use torrent::{Bitfield, InfoHash, PeerId};

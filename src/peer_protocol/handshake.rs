use super::PeerError;
use crate::torrent::{InfoHash, PeerId};

pub const HANDSHAKE_LEN: usize = std::mem::size_of::<PeerHandshake>();

#[derive(Debug, Clone, PartialEq)]
#[repr(C)] // makes sure the struct fields are arranged in the same order, there's also no padding
           // in between because all the fields are byte aligned. (i.e this can be treated as a
           // simple array of bytes).
pub struct PeerHandshake {
    protocol_prefix_length: u8,
    protocol_prefix: [u8; 19],
    reserved_bytes: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl AsRef<[u8; HANDSHAKE_LEN]> for PeerHandshake {
    fn as_ref(&self) -> &[u8; HANDSHAKE_LEN] {
        unsafe { std::mem::transmute::<&Self, &[u8; HANDSHAKE_LEN]>(self) }
    }
}

impl PeerHandshake {
    pub const PROTOCOL_PREFIX: [u8; 19] = *b"BitTorrent protocol";
    // BEP 10: reserved_bytes[5] & 0x10 advertises the extension protocol.
    const LTEP_BYTE: usize = 5;
    const LTEP_BIT: u8 = 0x10;

    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved_bytes = [0; 8];
        reserved_bytes[Self::LTEP_BYTE] |= Self::LTEP_BIT;

        Self {
            protocol_prefix_length: Self::PROTOCOL_PREFIX.len() as u8,
            protocol_prefix: Self::PROTOCOL_PREFIX,
            reserved_bytes,
            info_hash,
            peer_id,
        }
    }

    // the unsafe is fine becuase the struct is just plain old data, any sequence of bits is valid.
    pub fn from_bytes(bytes: [u8; HANDSHAKE_LEN]) -> Self {
        unsafe { std::mem::transmute::<[u8; HANDSHAKE_LEN], Self>(bytes) }
    }

    // the unsafe is fine becuase the struct is just plain old data, any sequence of bits is valid.
    pub fn into_bytes(self) -> [u8; HANDSHAKE_LEN] {
        unsafe { std::mem::transmute::<Self, [u8; HANDSHAKE_LEN]>(self) }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved_bytes[Self::LTEP_BYTE] & Self::LTEP_BIT != 0
    }

    /// checks a received handshake against our own torrent and identity.
    pub fn validate(&self, info_hash: &InfoHash, our_peer_id: &PeerId) -> Result<(), PeerError> {
        if self.protocol_prefix_length as usize != Self::PROTOCOL_PREFIX.len()
            || self.protocol_prefix != Self::PROTOCOL_PREFIX
        {
            return Err(PeerError::protocol(format!(
                "unknown protocol prefix in handshake '{}'",
                String::from_utf8_lossy(&self.protocol_prefix[..])
            )));
        }
        if self.info_hash != *info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        if self.peer_id == *our_peer_id {
            return Err(PeerError::SelfConnection);
        }
        Ok(())
    }
}

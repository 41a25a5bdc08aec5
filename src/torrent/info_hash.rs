use sha1_smol::Sha1;
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct InfoHash([u8; Self::INFO_HASH_SIZE]);

impl InfoHash {
    pub const INFO_HASH_SIZE: usize = sha1_smol::DIGEST_LENGTH;

    pub fn new(bytes: [u8; Self::INFO_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// sha1 of the canonically bencoded info dictionary.
    pub fn of_bencoded_info(info: &[u8]) -> Self {
        Self(Sha1::from(info).digest().bytes())
    }
}

impl AsRef<[u8; Self::INFO_HASH_SIZE]> for InfoHash {
    fn as_ref(&self) -> &[u8; Self::INFO_HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({self})")
    }
}

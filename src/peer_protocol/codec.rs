use super::PeerError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{
    bytes::{self, Buf, BufMut, Bytes},
    codec::{Decoder, Encoder, Framed},
};

pub type PeerFrames<S> = Framed<S, PeerMessageCodec>;

pub fn upgrade_stream<S: AsyncRead + AsyncWrite>(stream: S) -> PeerFrames<S> {
    Framed::new(stream, PeerMessageCodec::new())
}

#[repr(u8)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have(u32) = 4,
    Bitfield(Vec<u8>) = 5,
    Request {
        index: u32,
        begin: u32,
        length: u32,
    } = 6,
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    } = 7,
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    } = 8,
    /// LTEP message, `id` 0 is the extension handshake.
    Extended {
        id: u8,
        payload: Bytes,
    } = 20,
}

impl PeerMessage {
    pub fn tag(&self) -> u8 {
        // SAFETY: because PeerMessage is a repr(u8) its also repr(C) and the first byte(u8) represents
        // the enum tag (dereferencing the *self casted to a *u8 gives first byte).
        // taken from std::mem::discriminant docs.
        unsafe { *<*const _>::from(self).cast::<u8>() }
    }
}

#[derive(Debug, Default)]
pub struct PeerMessageCodec;

impl PeerMessageCodec {
    const LEN_HEADER_SIZE: usize = std::mem::size_of::<u32>();
    // a 16KiB block plus headers is far below this, only huge bitfields come close.
    pub const MAX_SIZE: usize = 2 * (1 << 20);

    pub fn new() -> Self {
        Self
    }

    // bail if the peer sends a payload whose length doesn't match the particular variant.
    fn bail_on_size_mismatch(src: &bytes::BytesMut, size: usize, tag: u8) -> Result<(), PeerError> {
        if src.len() != size {
            return Err(PeerError::protocol(format!(
                "payload of {} bytes does not match size {} for tag {}",
                src.len(),
                size,
                tag
            )));
        }
        Ok(())
    }

    // helper for the Cancel and Request variants only.
    fn decode_triple_variant(src: &mut bytes::BytesMut, tag: u8) -> Result<(u32, u32, u32), PeerError> {
        const TRIPLE_SIZE: usize = 3 * std::mem::size_of::<u32>();
        Self::bail_on_size_mismatch(src, TRIPLE_SIZE, tag)?;
        Ok((src.get_u32(), src.get_u32(), src.get_u32()))
    }
}

impl Decoder for PeerMessageCodec {
    /// `None` is a keep-alive.
    type Item = Option<PeerMessage>;
    type Error = PeerError;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, PeerError> {
        if src.len() < Self::LEN_HEADER_SIZE {
            // return None to signify that more bytes need to be read for current frame to be
            // decoded.
            return Ok(None);
        }

        // peek, the header stays in the buffer until the whole frame is there.
        let len_header = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // prevent malicious peers from hogging us.
        if len_header > Self::MAX_SIZE {
            return Err(PeerError::protocol(format!(
                "frames of size {} (>2 MiB) prevented from being decoded.",
                len_header
            )));
        }

        if src.len() < Self::LEN_HEADER_SIZE + len_header {
            src.reserve(Self::LEN_HEADER_SIZE + len_header - src.len());
            return Ok(None);
        }
        src.advance(Self::LEN_HEADER_SIZE);

        if len_header == 0 {
            // return Some(None) when message was a keepalive
            return Ok(Some(None));
        }

        let mut src = src.split_to(len_header);

        let tag = src.get_u8();
        type PM = PeerMessage;
        let msg = match tag {
            0..=3 => {
                Self::bail_on_size_mismatch(&src, 0, tag)?;
                match tag {
                    0 => PM::Choke,
                    1 => PM::Unchoke,
                    2 => PM::Interested,
                    _ => PM::NotInterested,
                }
            }
            4 => {
                Self::bail_on_size_mismatch(&src, std::mem::size_of::<u32>(), tag)?;
                PM::Have(src.get_u32())
            }
            // any amount of bytes is valid here, the connection checks it against the piece count.
            5 => PM::Bitfield(src.to_vec()),
            6 => {
                let (index, begin, length) = Self::decode_triple_variant(&mut src, tag)?;

                PM::Request {
                    index,
                    begin,
                    length,
                }
            }
            7 => {
                if src.len() < 2 * std::mem::size_of::<u32>() {
                    return Err(PeerError::protocol("piece message shorter than its header"));
                }

                PM::Piece {
                    index: src.get_u32(),
                    begin: src.get_u32(),
                    block: src.freeze(),
                }
            }
            8 => {
                let (index, begin, length) = Self::decode_triple_variant(&mut src, tag)?;

                PM::Cancel {
                    index,
                    begin,
                    length,
                }
            }
            20 => {
                if src.is_empty() {
                    return Err(PeerError::protocol("extension message without an id"));
                }

                PM::Extended {
                    id: src.get_u8(),
                    payload: src.freeze(),
                }
            }
            _ => {
                return Err(PeerError::protocol(format!(
                    "invalid protocol tag for peer message: {}",
                    tag
                )))
            }
        };

        Ok(Some(Some(msg)))
    }
}

impl Encoder<PeerMessage> for PeerMessageCodec {
    type Error = PeerError;

    fn encode(&mut self, item: PeerMessage, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        const TAG_LEN: u32 = std::mem::size_of::<u8>() as u32;
        let tag = item.tag();

        type PM = PeerMessage;
        match item {
            PM::Choke | PM::Unchoke | PM::Interested | PM::NotInterested => {
                dst.put_u32(TAG_LEN);
                dst.put_u8(tag);
            }
            PM::Have(index) => {
                dst.put_u32(TAG_LEN + std::mem::size_of::<u32>() as u32);
                dst.put_u8(tag);

                dst.put_u32(index);
            }
            PM::Request {
                index,
                begin,
                length,
            }
            | PM::Cancel {
                index,
                begin,
                length,
            } => {
                dst.put_u32(TAG_LEN + 3 * std::mem::size_of::<u32>() as u32);
                dst.put_u8(tag);

                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_u32(length);
            }

            PM::Piece {
                index,
                begin,
                block,
            } => {
                dst.reserve(Self::LEN_HEADER_SIZE + 9 + block.len());
                dst.put_u32(TAG_LEN + (2 * std::mem::size_of::<u32>() + block.len()) as u32);
                dst.put_u8(tag);

                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put(block);
            }

            PM::Bitfield(bitfield) => {
                dst.put_u32(TAG_LEN + bitfield.len() as u32);
                dst.put_u8(tag);

                dst.put(bitfield.as_slice());
            }

            PM::Extended { id, payload } => {
                dst.put_u32(TAG_LEN + 1 + payload.len() as u32);
                dst.put_u8(tag);

                dst.put_u8(id);
                dst.put(payload);
            }
        }
        Ok(())
    }
}

/// `None` encodes a keep-alive.
impl Encoder<Option<PeerMessage>> for PeerMessageCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        item: Option<PeerMessage>,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Some(msg) => Encoder::<PeerMessage>::encode(self, msg, dst),
            None => {
                dst.put_u32(0);
                Ok(())
            }
        }
    }
}

//! See [`Header`].

use {
    bytes::Bytes,
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
    static_assertions::const_assert_eq,
};

use crate::{ack::Acknowledge, seq::Seq};

/// Magic bytes prefixing every datagram of this protocol.
///
/// Receivers drop any datagram whose first 4 bytes differ, so stray traffic
/// aimed at our port never reaches the decoder proper.
pub const MAGIC: [u8; 4] = *b"sln1";

/// Header of a single datagram: the magic, the sender's sequence number, and
/// what the sender has received so far from us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sequence number of the package carried by this datagram.
    pub seq: Seq,
    /// Newest sequence the sender has seen from us, plus the 32 preceding
    /// acknowledgements.
    pub acks: Acknowledge,
}

// the body of every datagram starts at this fixed offset
const_assert_eq!(Header::ENCODE_LEN, 12);

/// Received a datagram whose first bytes are not [`MAGIC`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wrong protocol magic")]
pub struct WrongMagic;

impl octs::BufError for WrongMagic {}

impl FixedEncodeLen for Header {
    const ENCODE_LEN: usize = MAGIC.len() + Seq::ENCODE_LEN + Acknowledge::ENCODE_LEN;
}

impl Encode for Header {
    type Error = WrongMagic;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write_from(Bytes::from_static(&MAGIC))?;
        dst.write(self.seq)?;
        dst.write(self.acks)?;
        Ok(())
    }
}

impl Decode for Header {
    type Error = WrongMagic;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let magic = src.read_next(MAGIC.len())?;
        if magic != MAGIC.as_slice() {
            return Err(WrongMagic.into());
        }
        Ok(Self {
            seq: src.read()?,
            acks: src.read()?,
        })
    }
}

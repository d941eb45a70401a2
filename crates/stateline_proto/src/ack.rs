//! See [`Acknowledge`].

use {
    core::convert::Infallible,
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

use crate::seq::Seq;

/// Tracks which packages have been received from the peer
/// (acknowledgements).
///
/// This is the *Gaffer On Games* packet-level ack scheme, storing two pieces
/// of info:
/// * the newest received package sequence number (`last_recv`)
/// * a bitfield of which packages *before* `last_recv` have been received
///   (`bits`)
///
/// `last_recv` itself is implied received; bit `N` covers the package `N + 1`
/// steps before it. For example,
///
/// ```text
/// last_recv: 40
///      bits: 0b0000..00001001
///                    ^   ^  ^
///                    |   |  +- seq 39 (40 - 1) has been received
///                    |   +---- seq 36 (40 - 4) has been received
///                    +-------- seq 32 has NOT been received
/// ```
///
/// This info is sent in every package header, so each of the last 32
/// acknowledgements is delivered many times over, giving a lot of redundancy
/// for acks even on a lossy link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Acknowledge {
    /// Newest received package sequence number, or [`Seq::NEVER`] if no
    /// package has been received yet.
    pub last_recv: Seq,
    /// Bitfield of which packages before `last_recv` have been received.
    pub bits: u32,
}

/// `n << by`, evaluating to 0 when the shift is out of range.
const fn shl(n: u32, by: u16) -> u32 {
    if by >= u32::BITS as u16 { 0 } else { n << by }
}

impl Acknowledge {
    /// Creates a new value with no packages received.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a package sequence as received.
    ///
    /// # Example
    ///
    /// ```
    /// # use stateline_proto::{ack::Acknowledge, seq::Seq};
    /// let mut acks = Acknowledge::new();
    /// acks.ack(Seq(1));
    /// acks.ack(Seq(2));
    /// acks.ack(Seq(5));
    /// assert!(acks.is_acked(Seq(1)));
    /// assert!(acks.is_acked(Seq(2)));
    /// assert!(!acks.is_acked(Seq(3)));
    /// assert!(acks.is_acked(Seq(5)));
    ///
    /// // acknowledgement is idempotent
    /// let acks_clone = acks.clone();
    /// acks.ack(Seq(2));
    /// assert_eq!(acks, acks_clone);
    /// ```
    pub fn ack(&mut self, seq: Seq) {
        if self.last_recv == Seq::NEVER {
            self.last_recv = seq;
            return;
        }
        let ahead = seq.dist_from(self.last_recv);
        if seq.newer_than(self.last_recv) {
            // `seq` is the new `last_recv`; the window shifts under it and
            // the old `last_recv` lands on bit `ahead - 1`
            //
            //    seq: 8
            //    last_recv: 3
            // -> ahead: 8 - 3 = 5
            //    old bits: 0b00..000000000100
            //                             ^
            //                             | shifted `ahead` (5) places
            //                        v----+
            //    new bits: 0b00..000010010000
            //                           ^- the old `last_recv` (3 = 8 - 5)
            self.bits = shl(self.bits, ahead) | shl(1, ahead - 1);
            self.last_recv = seq;
        } else {
            // `seq` is somewhere before `last_recv`; set its bit if it is
            // still inside the window, else it's too old to matter
            let back = self.last_recv.dist_from(seq);
            if back > 0 {
                self.bits |= shl(1, back - 1);
            }
        }
    }

    /// Gets if a certain sequence has been marked as received.
    #[must_use]
    pub fn is_acked(&self, seq: Seq) -> bool {
        if self.last_recv == Seq::NEVER {
            return false;
        }
        let back = self.last_recv.dist_from(seq);
        match back {
            0 => true,
            1..=32 => self.bits & shl(1, back - 1) != 0,
            _ => false,
        }
    }

    /// Converts this into an iterator over all [`Seq`]s this value
    /// acknowledges.
    ///
    /// # Example
    ///
    /// ```
    /// # use stateline_proto::{ack::Acknowledge, seq::Seq};
    /// let acks = Acknowledge {
    ///     last_recv: Seq(50),
    ///     bits: 0b0010010,
    /// };
    /// let mut iter = acks.seqs();
    /// assert_eq!(Some(Seq(50)), iter.next());
    /// assert_eq!(Some(Seq(48)), iter.next());
    /// assert_eq!(Some(Seq(45)), iter.next());
    /// assert_eq!(None, iter.next());
    /// ```
    pub fn seqs(self) -> impl Iterator<Item = Seq> {
        // `last_recv` is implied received, unless we've never received at all
        let newest = (self.last_recv != Seq::NEVER).then_some(self.last_recv);
        newest.into_iter().chain((0..32u16).filter_map(move |bit| {
            if self.bits & shl(1, bit) == 0 {
                None
            } else {
                Some(self.last_recv.back(bit + 1))
            }
        }))
    }
}

impl FixedEncodeLen for Acknowledge {
    const ENCODE_LEN: usize = Seq::ENCODE_LEN + u32::ENCODE_LEN;
}

impl Encode for Acknowledge {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(self.last_recv)?;
        dst.write(self.bits)?;
        Ok(())
    }
}

impl Decode for Acknowledge {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            last_recv: src.read()?,
            bits: src.read()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use {octs::BytesMut, super::*};

    #[test]
    fn encode_decode() {
        let v = Acknowledge {
            last_recv: Seq(12),
            bits: 0b010101,
        };
        let mut buf = BytesMut::with_capacity(Acknowledge::ENCODE_LEN);

        buf.write(&v).unwrap();
        assert_eq!(Acknowledge::ENCODE_LEN, buf.len());

        assert_eq!(v, buf.freeze().read::<Acknowledge>().unwrap());
    }

    #[test]
    fn window_tracks_received_seqs() {
        let mut acks = Acknowledge::new();
        for n in [1, 2, 3, 5, 30, 33] {
            acks.ack(Seq(n));
        }
        assert_eq!(Seq(33), acks.last_recv);

        for n in [1, 2, 3, 5, 30, 33] {
            assert!(acks.is_acked(Seq(n)), "{n} should be acked");
        }
        for n in [4, 6, 29, 31, 32, 34] {
            assert!(!acks.is_acked(Seq(n)), "{n} should not be acked");
        }

        // 1 has fallen out of the 32-wide window now
        acks.ack(Seq(34));
        assert!(!acks.is_acked(Seq(1)));
        assert!(acks.is_acked(Seq(2)));
    }

    #[test]
    fn window_wraps_the_ring() {
        let mut acks = Acknowledge::new();
        acks.ack(Seq(u16::MAX - 1));
        acks.ack(Seq(u16::MAX));
        acks.ack(Seq(2));
        assert_eq!(Seq(2), acks.last_recv);
        assert!(acks.is_acked(Seq(u16::MAX - 1)));
        assert!(acks.is_acked(Seq(u16::MAX)));
        assert!(!acks.is_acked(Seq(1)));
        assert!(acks.is_acked(Seq(2)));
    }

    #[test]
    fn seqs_covers_window() {
        let mut acks = Acknowledge::new();
        for n in [1, 4, 5] {
            acks.ack(Seq(n));
        }
        let mut seqs = acks.seqs().collect::<Vec<_>>();
        seqs.sort_by_key(|seq| seq.0);
        assert_eq!(vec![Seq(1), Seq(4), Seq(5)], seqs);
    }

    #[test]
    fn very_old_seq_is_ignored() {
        let mut acks = Acknowledge::new();
        acks.ack(Seq(100));
        acks.ack(Seq(1));
        assert_eq!(Seq(100), acks.last_recv);
        assert!(!acks.is_acked(Seq(1)));
    }
}

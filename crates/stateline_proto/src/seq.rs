//! See [`Seq`].

use {
    core::convert::Infallible,
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Sequence number identifying a package within one direction of a
/// connection, or the time order of a game state snapshot.
///
/// The number is stored as a [`u16`] and lives on the ring `1..=`[`Seq::MAX`]:
/// incrementing [`Seq::MAX`] wraps back around to `1`, never to `0`. The value
/// `0` is reserved as [`Seq::NEVER`] and means "no package was ever sent or
/// received in this direction".
///
/// # Wraparound
///
/// A [`u16`] is relatively very small, and at tens of packages per second the
/// sequence wraps within the hour. Never compare two sequence numbers with
/// `<`/`>`; use [`Seq::newer_than`], which respects wraparound by looking at
/// the cyclic distance between the two values:
///
/// ```text
///     65533  65534  65535    1      2
/// ... --|------|------|------|------|-- ...
/// ```
///
/// `a` is newer than `b` iff the distance travelled forward along the ring
/// from `b` to `a` is at most half the ring. If two values are further apart
/// than that, no guarantees are upheld - that would mean one side is over
/// 32 000 packages behind the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Seq(pub u16);

/// Half of the sequence number ring, used as the newer-than cutoff.
const HALF: u16 = u16::MAX / 2;

impl Seq {
    /// Sequence number with the largest value on the ring.
    pub const MAX: Self = Self(u16::MAX);

    /// Reserved value meaning "no package yet" in a given direction.
    pub const NEVER: Self = Self(0);

    /// Returns the sequence number after `self` on the ring.
    ///
    /// # Example
    ///
    /// ```
    /// # use stateline_proto::seq::Seq;
    /// assert_eq!(Seq(1).next(), Seq(2));
    /// assert_eq!(Seq::MAX.next(), Seq(1));
    /// assert_eq!(Seq::NEVER.next(), Seq(1));
    /// ```
    #[must_use]
    pub const fn next(self) -> Self {
        if self.0 == u16::MAX { Self(1) } else { Self(self.0 + 1) }
    }

    /// Gets how many steps forward along the ring it takes to travel from
    /// `rhs` to `self`.
    ///
    /// Both operands are expected to be on the ring (nonzero); the result for
    /// [`Seq::NEVER`] operands is meaningless.
    ///
    /// # Example
    ///
    /// ```
    /// # use stateline_proto::seq::Seq;
    /// assert_eq!(Seq(5).dist_from(Seq(5)), 0);
    /// assert_eq!(Seq(5).dist_from(Seq(3)), 2);
    /// assert_eq!(Seq(1).dist_from(Seq::MAX), 1);
    /// assert_eq!(Seq(3).dist_from(Seq::MAX), 3);
    /// ```
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // result of `% RING` fits
    pub const fn dist_from(self, rhs: Self) -> u16 {
        const RING: u32 = u16::MAX as u32;
        (((self.0 as u32 + RING) - rhs.0 as u32) % RING) as u16
    }

    /// Returns the sequence number `n` steps back along the ring.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // result of `% RING` fits
    pub const fn back(self, n: u16) -> Self {
        const RING: u32 = u16::MAX as u32;
        Self((((self.0 as u32 + RING - 1) - n as u32) % RING + 1) as u16)
    }

    /// Logically compares `self` to `rhs` in a way that respects wraparound.
    ///
    /// A real sequence number is always newer than [`Seq::NEVER`], and
    /// [`Seq::NEVER`] is newer than nothing.
    ///
    /// # Example
    ///
    /// ```
    /// # use stateline_proto::seq::Seq;
    /// assert!(Seq(2).newer_than(Seq(1)));
    /// assert!(!Seq(1).newer_than(Seq(2)));
    /// assert!(!Seq(1).newer_than(Seq(1)));
    ///
    /// // wraparound
    /// assert!(Seq(2).newer_than(Seq::MAX));
    /// assert!(!Seq::MAX.newer_than(Seq(2)));
    ///
    /// // the reserved zero is older than everything
    /// assert!(Seq(1).newer_than(Seq::NEVER));
    /// assert!(!Seq::NEVER.newer_than(Seq(1)));
    /// ```
    #[must_use]
    pub const fn newer_than(self, rhs: Self) -> bool {
        if self.0 == 0 {
            return false;
        }
        if rhs.0 == 0 {
            return true;
        }
        let dist = self.dist_from(rhs);
        dist != 0 && dist <= HALF
    }
}

impl FixedEncodeLen for Seq {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for Seq {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(self.0)
    }
}

impl Decode for Seq {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

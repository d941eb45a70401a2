//! See [`Value`].

use {
    bytes::{Buf, BufMut, Bytes},
    core::convert::Infallible,
    octs::{BufTooShortOr, Decode, Encode, EncodeLen, FixedEncodeLen, Read, Write},
    std::collections::BTreeMap,
};

use crate::seq::Seq;

/// A schemaless wire value.
///
/// This is the serializable primitive set for everything user-attached:
/// event arguments and game state attributes. Values are self-describing on
/// the wire via a one-byte tag, so no schema negotiation is needed between
/// peers.
///
/// Sequence numbers get their own tag rather than travelling as plain
/// integers, so they round-trip width-exact.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// IEEE-754 double-precision float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw byte string.
    Blob(Bytes),
    /// Sequence number.
    Seq(Seq),
    /// Ordered array of values.
    List(Vec<Value>),
    /// String-keyed mapping of values.
    ///
    /// A [`BTreeMap`] so that encoding is deterministic.
    Map(BTreeMap<String, Value>),
}

pub(crate) const TAG_NIL: u8 = 0x00;
pub(crate) const TAG_FALSE: u8 = 0x01;
pub(crate) const TAG_TRUE: u8 = 0x02;
pub(crate) const TAG_INT: u8 = 0x03;
pub(crate) const TAG_FLOAT: u8 = 0x04;
pub(crate) const TAG_STR: u8 = 0x05;
pub(crate) const TAG_BLOB: u8 = 0x06;
pub(crate) const TAG_SEQ: u8 = 0x07;
pub(crate) const TAG_LIST: u8 = 0x08;
pub(crate) const TAG_MAP: u8 = 0x09;
/// Marks a key for removal inside a state update; never valid as a [`Value`].
pub(crate) const TAG_DELETE: u8 = 0x0f;

/// Failed to encode or decode a [`Value`] or a type built from values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    /// Read a tag byte which does not map to any value kind.
    #[error("invalid tag `{0:#04x}`")]
    InvalidTag(u8),
    /// Read string data which is not valid UTF-8.
    #[error("string is not valid UTF-8")]
    NonUtf8,
    /// Attempted to encode a string or collection too long for its length
    /// prefix.
    #[error("length {len} too long to encode")]
    TooLong {
        /// Length of the offending string or collection.
        len: usize,
    },
}

impl octs::BufError for ValueError {}

impl From<Infallible> for ValueError {
    fn from(err: Infallible) -> Self {
        match err {}
    }
}

/// Encodes a `u16` length prefix, erroring if `len` does not fit.
pub(crate) fn write_len(
    mut dst: impl Write,
    len: usize,
) -> Result<(), BufTooShortOr<ValueError>> {
    let len = u16::try_from(len).map_err(|_| ValueError::TooLong { len })?;
    dst.write(len)?;
    Ok(())
}

pub(crate) fn read_len(mut src: impl Read) -> Result<usize, BufTooShortOr<ValueError>> {
    let len = src.read::<u16>()?;
    Ok(usize::from(len))
}

pub(crate) fn write_str(mut dst: impl Write, s: &str) -> Result<(), BufTooShortOr<ValueError>> {
    write_len(&mut dst, s.len())?;
    dst.write_from(Bytes::copy_from_slice(s.as_bytes()))?;
    Ok(())
}

pub(crate) fn read_str(mut src: impl Read) -> Result<String, BufTooShortOr<ValueError>> {
    let len = read_len(&mut src)?;
    let bytes = src.read_next(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ValueError::NonUtf8.into())
}

pub(crate) fn str_len(s: &str) -> usize {
    2 + s.len()
}

impl Value {
    /// Decodes the value whose tag byte has already been read.
    pub(crate) fn decode_after_tag(
        tag: u8,
        mut src: impl Read,
    ) -> Result<Self, BufTooShortOr<ValueError>> {
        // Erase the buffer type here so that decoding arbitrarily nested
        // `List`/`Map` values resolves to a single fixed monomorphization
        // instead of growing the buffer's reference-wrapper type by one
        // layer per nesting level (which would blow up compilation).
        let mut src: &mut dyn Buf = &mut src;
        match tag {
            TAG_NIL => Ok(Self::Nil),
            TAG_FALSE => Ok(Self::Bool(false)),
            TAG_TRUE => Ok(Self::Bool(true)),
            #[allow(clippy::cast_possible_wrap)] // round-trips two's complement
            TAG_INT => Ok(Self::Int(src.read::<u64>()? as i64)),
            TAG_FLOAT => Ok(Self::Float(f64::from_bits(src.read::<u64>()?))),
            TAG_STR => Ok(Self::Str(read_str(&mut src)?)),
            TAG_BLOB => {
                let len = read_len(&mut src)?;
                Ok(Self::Blob(src.read_next(len)?))
            }
            TAG_SEQ => Ok(Self::Seq(src.read()?)),
            TAG_LIST => {
                let len = read_len(&mut src)?;
                let mut items = Vec::new();
                for _ in 0..len {
                    items.push(src.read::<Self>()?);
                }
                Ok(Self::List(items))
            }
            TAG_MAP => {
                let len = read_len(&mut src)?;
                let mut entries = BTreeMap::new();
                for _ in 0..len {
                    let key = read_str(&mut src)?;
                    entries.insert(key, src.read::<Self>()?);
                }
                Ok(Self::Map(entries))
            }
            tag => Err(ValueError::InvalidTag(tag).into()),
        }
    }

    /// Gets the contained integer, if this is an [`Value::Int`].
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        if let Self::Int(n) = self { Some(*n) } else { None }
    }

    /// Gets the contained float, if this is a [`Value::Float`].
    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        if let Self::Float(x) = self { Some(*x) } else { None }
    }

    /// Gets the contained string, if this is a [`Value::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        if let Self::Str(s) = self { Some(s) } else { None }
    }

    /// Gets the contained boolean, if this is a [`Value::Bool`].
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        if let Self::Bool(b) = self { Some(*b) } else { None }
    }
}

impl EncodeLen for Value {
    fn encode_len(&self) -> usize {
        1 + match self {
            Self::Nil | Self::Bool(_) => 0,
            Self::Int(_) | Self::Float(_) => u64::ENCODE_LEN,
            Self::Str(s) => str_len(s),
            Self::Blob(bytes) => 2 + bytes.len(),
            Self::Seq(_) => Seq::ENCODE_LEN,
            Self::List(items) => 2 + items.iter().map(EncodeLen::encode_len).sum::<usize>(),
            Self::Map(entries) => {
                2 + entries
                    .iter()
                    .map(|(key, value)| str_len(key) + value.encode_len())
                    .sum::<usize>()
            }
        }
    }
}

impl Encode for Value {
    type Error = ValueError;

    #[allow(clippy::cast_sign_loss)] // round-trips two's complement
    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        // Erase the buffer type here so that encoding arbitrarily nested
        // `List`/`Map` values resolves to a single fixed monomorphization
        // instead of growing the buffer's reference-wrapper type by one
        // layer per nesting level (which would blow up compilation).
        let mut dst: &mut dyn BufMut = &mut dst;
        match self {
            Self::Nil => {
                dst.write(TAG_NIL)?;
            }
            Self::Bool(false) => {
                dst.write(TAG_FALSE)?;
            }
            Self::Bool(true) => {
                dst.write(TAG_TRUE)?;
            }
            Self::Int(n) => {
                dst.write(TAG_INT)?;
                dst.write(*n as u64)?;
            }
            Self::Float(x) => {
                dst.write(TAG_FLOAT)?;
                dst.write(x.to_bits())?;
            }
            Self::Str(s) => {
                dst.write(TAG_STR)?;
                write_str(&mut dst, s)?;
            }
            Self::Blob(bytes) => {
                dst.write(TAG_BLOB)?;
                write_len(&mut dst, bytes.len())?;
                dst.write_from(bytes.clone())?;
            }
            Self::Seq(seq) => {
                dst.write(TAG_SEQ)?;
                dst.write(*seq)?;
            }
            Self::List(items) => {
                dst.write(TAG_LIST)?;
                write_len(&mut dst, items.len())?;
                for item in items {
                    dst.write(item)?;
                }
            }
            Self::Map(entries) => {
                dst.write(TAG_MAP)?;
                write_len(&mut dst, entries.len())?;
                for (key, value) in entries {
                    write_str(&mut dst, key)?;
                    dst.write(value)?;
                }
            }
        }
        Ok(())
    }
}

impl Decode for Value {
    type Error = ValueError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let tag = src.read::<u8>()?;
        Self::decode_after_tag(tag, &mut src)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Seq> for Value {
    fn from(value: Seq) -> Self {
        Self::Seq(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Self::Blob(value)
    }
}

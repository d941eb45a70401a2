//! Datagram bodies and whole-datagram assembly.
//!
//! A datagram is `Header || body`, where the body is one of three shapes:
//!
//! * [`EventBody`] - just events, the minimal form
//! * [`ClientBody`] - what a client sends: the time order of its state
//!   mirror, plus events
//! * [`ServerBody`] - what a server sends: the delta catching the client up,
//!   plus events
//!
//! Which shape a body has is implied by who sent the datagram; nothing on the
//! wire tags it.

use {
    bytes::Bytes,
    octs::{BufTooShortOr, BytesMut, Decode, Encode, EncodeLen, FixedEncodeLen, Read, Write},
};

use crate::{
    event::Event,
    header::{Header, WrongMagic},
    seq::Seq,
    state::GameStateUpdate,
    value::{self, ValueError},
};

/// Largest datagram this protocol will produce or accept, in bytes.
pub const MAX_DATAGRAM_LEN: usize = 2048;

/// Body shape carrying only events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBody {
    /// Events carried by this package.
    pub events: Vec<Event>,
}

/// Body shape sent by a client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientBody {
    /// Time order of the last update the client has applied to its state
    /// mirror, used by the server to compute the next delta.
    pub time_order: Seq,
    /// Events carried by this package.
    pub events: Vec<Event>,
}

/// Body shape sent by a server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerBody {
    /// Delta intended to catch the receiving client up to the authoritative
    /// state.
    pub update: GameStateUpdate,
    /// Events carried by this package.
    pub events: Vec<Event>,
}

fn events_len(events: &[Event]) -> usize {
    2 + events.iter().map(EncodeLen::encode_len).sum::<usize>()
}

fn write_events(mut dst: impl Write, events: &[Event]) -> Result<(), BufTooShortOr<ValueError>> {
    value::write_len(&mut dst, events.len())?;
    for event in events {
        dst.write(event)?;
    }
    Ok(())
}

fn read_events(mut src: impl Read) -> Result<Vec<Event>, BufTooShortOr<ValueError>> {
    let len = value::read_len(&mut src)?;
    let mut events = Vec::new();
    for _ in 0..len {
        events.push(src.read::<Event>()?);
    }
    Ok(events)
}

impl EncodeLen for EventBody {
    fn encode_len(&self) -> usize {
        events_len(&self.events)
    }
}

impl Encode for EventBody {
    type Error = ValueError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        write_events(&mut dst, &self.events)
    }
}

impl Decode for EventBody {
    type Error = ValueError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            events: read_events(&mut src)?,
        })
    }
}

impl EncodeLen for ClientBody {
    fn encode_len(&self) -> usize {
        Seq::ENCODE_LEN + events_len(&self.events)
    }
}

impl Encode for ClientBody {
    type Error = ValueError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(self.time_order)?;
        write_events(&mut dst, &self.events)
    }
}

impl Decode for ClientBody {
    type Error = ValueError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            time_order: src.read()?,
            events: read_events(&mut src)?,
        })
    }
}

impl EncodeLen for ServerBody {
    fn encode_len(&self) -> usize {
        self.update.encode_len() + events_len(&self.events)
    }
}

impl Encode for ServerBody {
    type Error = ValueError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.update)?;
        write_events(&mut dst, &self.events)
    }
}

impl Decode for ServerBody {
    type Error = ValueError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            update: src.read()?,
            events: read_events(&mut src)?,
        })
    }
}

/// Attempted to encode a datagram longer than the configured maximum.
///
/// The datagram is not sent and the connection is unaffected; the caller must
/// drop or split whatever it attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("datagram would be {len} / {max} bytes")]
pub struct SizeOverflow {
    /// Encoded length the datagram would have had.
    pub len: usize,
    /// Maximum allowed datagram length.
    pub max: usize,
}

/// Failed to decode a received datagram.
#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    /// Failed to read the [`Header`], either because the datagram is
    /// truncated or because it is not ours (wrong magic).
    #[error("failed to read header")]
    ReadHeader(#[source] BufTooShortOr<WrongMagic>),
    /// Header was fine but the body is malformed.
    #[error("failed to read body")]
    ReadBody(#[source] BufTooShortOr<ValueError>),
}

/// Encodes a full datagram, measuring it first so an over-size package is
/// an error rather than a truncated send.
pub fn write_datagram<B>(header: &Header, body: &B, max_len: usize) -> Result<Bytes, SizeOverflow>
where
    B: Encode<Error = ValueError> + EncodeLen,
{
    let len = Header::ENCODE_LEN + body.encode_len();
    if len > max_len {
        return Err(SizeOverflow { len, max: max_len });
    }
    let mut buf = BytesMut::with_capacity(len);
    header.encode(&mut buf).unwrap();
    body.encode(&mut buf).unwrap();
    Ok(buf.freeze())
}

/// Decodes a full datagram into its header and body.
pub fn read_datagram<B>(datagram: impl Into<Bytes>) -> Result<(Header, B), DatagramError>
where
    B: Decode<Error = ValueError>,
{
    let mut buf = datagram.into();
    let header = buf
        .read::<Header>()
        .map_err(DatagramError::ReadHeader)?;
    let body = buf.read::<B>().map_err(DatagramError::ReadBody)?;
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use {
        assert_matches::assert_matches,
        std::collections::BTreeMap,
        super::*,
        crate::{
            ack::Acknowledge,
            state::Patch,
            value::Value,
        },
    };

    fn header() -> Header {
        Header {
            seq: Seq(10),
            acks: Acknowledge {
                last_recv: Seq(8),
                bits: 0b1,
            },
        }
    }

    #[test]
    fn client_round_trip() {
        let body = ClientBody {
            time_order: Seq(42),
            events: vec![Event::new("ATTACK").with_kwarg("attack_position", 0.05)],
        };
        let datagram = write_datagram(&header(), &body, MAX_DATAGRAM_LEN).unwrap();
        assert_eq!(Header::ENCODE_LEN + body.encode_len(), datagram.len());

        let (out_header, out_body) = read_datagram::<ClientBody>(datagram).unwrap();
        assert_eq!(header(), out_header);
        assert_eq!(body, out_body);
    }

    #[test]
    fn server_round_trip() {
        let body = ServerBody {
            update: GameStateUpdate::new(Seq(43))
                .with_attr("hp", Patch::set(90i64))
                .with_attr("dead_key", Patch::Remove),
            events: vec![Event::new("PING")],
        };
        let datagram = write_datagram(&header(), &body, MAX_DATAGRAM_LEN).unwrap();

        let (_, out_body) = read_datagram::<ServerBody>(datagram).unwrap();
        assert_eq!(body, out_body);
    }

    #[test]
    fn event_round_trip() {
        let body = EventBody {
            events: vec![
                Event::new("one"),
                Event::new("two").with_arg(Value::Map(BTreeMap::from([(
                    "nested".to_owned(),
                    Value::List(vec![Value::Int(1), Value::Nil]),
                )]))),
            ],
        };
        let datagram = write_datagram(&header(), &body, MAX_DATAGRAM_LEN).unwrap();

        let (_, out_body) = read_datagram::<EventBody>(datagram).unwrap();
        assert_eq!(body, out_body);
    }

    #[test]
    fn oversize_is_an_encode_error() {
        let body = EventBody {
            events: vec![Event::new("big").with_arg(Value::Str("x".repeat(3000)))],
        };
        assert_matches!(
            write_datagram(&header(), &body, MAX_DATAGRAM_LEN),
            Err(SizeOverflow { max: MAX_DATAGRAM_LEN, .. })
        );
    }

    #[test]
    fn wrong_magic_is_a_header_error() {
        let body = EventBody::default();
        let datagram = write_datagram(&header(), &body, MAX_DATAGRAM_LEN).unwrap();
        let mut bytes = datagram.to_vec();
        bytes[0] = b'X';

        assert_matches!(
            read_datagram::<EventBody>(Bytes::from(bytes)),
            Err(DatagramError::ReadHeader(_))
        );
    }
}

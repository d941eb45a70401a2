//! See [`Event`].

use {
    octs::{BufTooShortOr, Decode, Encode, EncodeLen, Read, Write},
    std::collections::BTreeMap,
};

use crate::value::{self, Value, ValueError};

/// Reserved event name which asks the backend to shut down.
///
/// Only honored when dispatched by the host client (the first peer to
/// connect). This is an advisory permission check on the sender address, not
/// a security boundary.
pub const SHUTDOWN_EVENT: &str = "__shutdown__";

/// Prefix of event names reserved for the protocol itself.
pub const RESERVED_PREFIX: &str = "__";

/// A named, data-carrying message dispatched to a registered handler on the
/// other side of a connection.
///
/// Events have no identity of their own on the wire; for acknowledgement and
/// retry purposes they are identified by the sequence number of the datagram
/// carrying them.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Name of the event, used to look up its handler.
    pub name: String,
    /// Positional arguments passed to the handler.
    pub args: Vec<Value>,
    /// Keyword arguments passed to the handler.
    pub kwargs: BTreeMap<String, Value>,
}

impl Event {
    /// Creates an event with no attached data.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets a keyword argument.
    #[must_use]
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Gets if this event's name is reserved for protocol use.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.name.starts_with(RESERVED_PREFIX)
    }
}

impl EncodeLen for Event {
    fn encode_len(&self) -> usize {
        value::str_len(&self.name)
            + 2
            + self.args.iter().map(EncodeLen::encode_len).sum::<usize>()
            + 2
            + self
                .kwargs
                .iter()
                .map(|(key, val)| value::str_len(key) + val.encode_len())
                .sum::<usize>()
    }
}

impl Encode for Event {
    type Error = ValueError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        value::write_str(&mut dst, &self.name)?;
        value::write_len(&mut dst, self.args.len())?;
        for arg in &self.args {
            dst.write(arg)?;
        }
        value::write_len(&mut dst, self.kwargs.len())?;
        for (key, val) in &self.kwargs {
            value::write_str(&mut dst, key)?;
            dst.write(val)?;
        }
        Ok(())
    }
}

impl Decode for Event {
    type Error = ValueError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let name = value::read_str(&mut src)?;
        let num_args = value::read_len(&mut src)?;
        let mut args = Vec::new();
        for _ in 0..num_args {
            args.push(src.read::<Value>()?);
        }
        let num_kwargs = value::read_len(&mut src)?;
        let mut kwargs = BTreeMap::new();
        for _ in 0..num_kwargs {
            let key = value::read_str(&mut src)?;
            kwargs.insert(key, src.read::<Value>()?);
        }
        Ok(Self { name, args, kwargs })
    }
}

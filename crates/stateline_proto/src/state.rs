//! Game state snapshots and the sparse updates which evolve them.

use {
    octs::{BufTooShortOr, Decode, Encode, EncodeLen, FixedEncodeLen, Read, Write},
    std::collections::BTreeMap,
};

use crate::{
    seq::Seq,
    value::{self, Value, ValueError, TAG_DELETE},
};

/// Whether the backend simulation loop is currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GameStatus {
    /// The simulation loop is stopped.
    #[default]
    Paused,
    /// The simulation loop is running.
    Active,
}

impl GameStatus {
    const fn to_byte(self) -> u8 {
        match self {
            Self::Paused => 0,
            Self::Active => 1,
        }
    }

    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Paused),
            1 => Some(Self::Active),
            _ => None,
        }
    }
}

/// A snapshot of the authoritative game state.
///
/// Apart from [`GameState::time_order`] and [`GameState::status`], the state
/// is an open attribute map: every key is user-defined and carries a wire
/// [`Value`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameState {
    /// Time order of this snapshot. Strictly increases (along the sequence
    /// ring) as updates are applied.
    pub time_order: Seq,
    /// Whether the simulation producing this state is running.
    pub status: GameStatus,
    /// User-defined attributes.
    pub attrs: BTreeMap<String, Value>,
}

impl GameState {
    /// Creates a paused state at time order [`Seq::NEVER`] with the given
    /// attributes.
    #[must_use]
    pub fn new(attrs: BTreeMap<String, Value>) -> Self {
        Self {
            time_order: Seq::NEVER,
            status: GameStatus::Paused,
            attrs,
        }
    }

    /// Gets an attribute by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// Gets an integer attribute by key.
    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.attrs.get(key).and_then(Value::as_int)
    }

    /// Gets a float attribute by key.
    #[must_use]
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.attrs.get(key).and_then(Value::as_float)
    }

    /// Gets a string attribute by key.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    /// Applies an update to this state.
    ///
    /// Patched keys are overwritten or removed regardless of the update's
    /// age, but [`GameState::time_order`] only ever moves forward: applying
    /// an old update never rewinds it.
    pub fn apply(&mut self, update: &GameStateUpdate) {
        for (key, patch) in &update.attrs {
            match patch {
                Patch::Set(val) => {
                    self.attrs.insert(key.clone(), val.clone());
                }
                Patch::Remove => {
                    self.attrs.remove(key);
                }
            }
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if update.time_order.newer_than(self.time_order) {
            self.time_order = update.time_order;
        }
    }
}

/// Change to a single game state attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Sets the attribute to a new value.
    Set(Value),
    /// Removes the attribute from the state.
    Remove,
}

impl Patch {
    /// Creates a [`Patch::Set`] from anything convertible to a [`Value`].
    pub fn set(value: impl Into<Value>) -> Self {
        Self::Set(value.into())
    }
}

/// A sparse, time-ordered delta between two [`GameState`]s.
///
/// Only keys that change are present. Updates compose by [merging] and evolve
/// states by [application]; two composed updates applied at once land on the
/// same state as applying them one by one.
///
/// [merging]: GameStateUpdate::merge
/// [application]: GameState::apply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameStateUpdate {
    /// Time order of the state this update produces.
    pub time_order: Seq,
    /// New simulation status, if it changed.
    pub status: Option<GameStatus>,
    /// Patched attributes.
    pub attrs: BTreeMap<String, Patch>,
}

impl GameStateUpdate {
    /// Creates an empty update producing the given time order.
    #[must_use]
    pub fn new(time_order: Seq) -> Self {
        Self {
            time_order,
            status: None,
            attrs: BTreeMap::new(),
        }
    }

    /// Adds an attribute patch.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, patch: impl Into<Patch>) -> Self {
        self.attrs.insert(key.into(), patch.into());
        self
    }

    /// Builds the update which takes *any* state to an exact copy of
    /// `state`, used to resynchronize a peer that has fallen too far behind
    /// to be caught up by deltas.
    ///
    /// Note that this cannot remove attributes the peer invented on its own;
    /// it sets every attribute `state` has.
    #[must_use]
    pub fn snapshot_of(state: &GameState) -> Self {
        Self {
            time_order: state.time_order,
            status: Some(state.status),
            attrs: state
                .attrs
                .iter()
                .map(|(key, val)| (key.clone(), Patch::Set(val.clone())))
                .collect(),
        }
    }

    /// Composes this update with one produced after it.
    ///
    /// Per key, the newer update wins; removals propagate like any other
    /// patch. The result's time order is the max of the two.
    #[must_use]
    pub fn merge(mut self, newer: Self) -> Self {
        for (key, patch) in newer.attrs {
            self.attrs.insert(key, patch);
        }
        Self {
            time_order: if newer.time_order.newer_than(self.time_order) {
                newer.time_order
            } else {
                self.time_order
            },
            status: newer.status.or(self.status),
            attrs: self.attrs,
        }
    }
}

impl From<Value> for Patch {
    fn from(value: Value) -> Self {
        Self::Set(value)
    }
}

impl Encode for Patch {
    type Error = ValueError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        match self {
            Self::Set(val) => dst.write(val),
            Self::Remove => {
                dst.write(TAG_DELETE)?;
                Ok(())
            }
        }
    }
}

impl Decode for Patch {
    type Error = ValueError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let tag = src.read::<u8>()?;
        if tag == TAG_DELETE {
            Ok(Self::Remove)
        } else {
            Ok(Self::Set(Value::decode_after_tag(tag, &mut src)?))
        }
    }
}

impl EncodeLen for Patch {
    fn encode_len(&self) -> usize {
        match self {
            Self::Set(val) => val.encode_len(),
            Self::Remove => 1,
        }
    }
}

// absent status on the wire
const STATUS_NONE: u8 = 0xff;

impl EncodeLen for GameStateUpdate {
    fn encode_len(&self) -> usize {
        Seq::ENCODE_LEN
            + 1
            + 2
            + self
                .attrs
                .iter()
                .map(|(key, patch)| value::str_len(key) + patch.encode_len())
                .sum::<usize>()
    }
}

impl Encode for GameStateUpdate {
    type Error = ValueError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(self.time_order)?;
        dst.write(self.status.map_or(STATUS_NONE, GameStatus::to_byte))?;
        value::write_len(&mut dst, self.attrs.len())?;
        for (key, patch) in &self.attrs {
            value::write_str(&mut dst, key)?;
            dst.write(patch)?;
        }
        Ok(())
    }
}

impl Decode for GameStateUpdate {
    type Error = ValueError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let time_order = src.read::<Seq>()?;
        let status_byte = src.read::<u8>()?;
        let status = if status_byte == STATUS_NONE {
            None
        } else {
            Some(GameStatus::from_byte(status_byte).ok_or(ValueError::InvalidTag(status_byte))?)
        };
        let num_attrs = value::read_len(&mut src)?;
        let mut attrs = BTreeMap::new();
        for _ in 0..num_attrs {
            let key = value::read_str(&mut src)?;
            attrs.insert(key, src.read::<Patch>()?);
        }
        Ok(Self {
            time_order,
            status,
            attrs,
        })
    }
}

impl EncodeLen for GameState {
    fn encode_len(&self) -> usize {
        Seq::ENCODE_LEN
            + 1
            + 2
            + self
                .attrs
                .iter()
                .map(|(key, val)| value::str_len(key) + val.encode_len())
                .sum::<usize>()
    }
}

impl Encode for GameState {
    type Error = ValueError;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(self.time_order)?;
        dst.write(self.status.to_byte())?;
        value::write_len(&mut dst, self.attrs.len())?;
        for (key, val) in &self.attrs {
            value::write_str(&mut dst, key)?;
            dst.write(val)?;
        }
        Ok(())
    }
}

impl Decode for GameState {
    type Error = ValueError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let time_order = src.read::<Seq>()?;
        let status_byte = src.read::<u8>()?;
        let status =
            GameStatus::from_byte(status_byte).ok_or(ValueError::InvalidTag(status_byte))?;
        let num_attrs = value::read_len(&mut src)?;
        let mut attrs = BTreeMap::new();
        for _ in 0..num_attrs {
            let key = value::read_str(&mut src)?;
            attrs.insert(key, src.read::<Value>()?);
        }
        Ok(Self {
            time_order,
            status,
            attrs,
        })
    }
}

#[cfg(test)]
mod tests {
    use {octs::BytesMut, super::*};

    fn state() -> GameState {
        let mut state = GameState::new(BTreeMap::from([
            ("hp".to_owned(), Value::Int(100)),
            ("position".to_owned(), Value::Float(0.0)),
        ]));
        state.time_order = Seq(5);
        state.status = GameStatus::Active;
        state
    }

    #[test]
    fn encode_decode_state() {
        let v = state();
        let mut buf = BytesMut::new();

        buf.write(&v).unwrap();
        assert_eq!(v.encode_len(), buf.len());

        assert_eq!(v, buf.freeze().read::<GameState>().unwrap());
    }

    #[test]
    fn encode_decode_update() {
        let v = GameStateUpdate::new(Seq(6))
            .with_attr("hp", Patch::set(90i64))
            .with_attr("position", Patch::Remove);
        let mut buf = BytesMut::new();

        buf.write(&v).unwrap();
        assert_eq!(v.encode_len(), buf.len());

        assert_eq!(v, buf.freeze().read::<GameStateUpdate>().unwrap());
    }

    #[test]
    fn apply_patches_and_advances() {
        let mut state = state();
        state.apply(
            &GameStateUpdate::new(Seq(6))
                .with_attr("hp", Patch::set(90i64))
                .with_attr("position", Patch::Remove),
        );

        assert_eq!(Seq(6), state.time_order);
        assert_eq!(Some(90), state.get_int("hp"));
        assert_eq!(None, state.get("position"));
    }

    #[test]
    fn apply_never_rewinds_time_order() {
        let mut state = state();
        state.apply(&GameStateUpdate::new(Seq(3)).with_attr("hp", Patch::set(1i64)));

        assert_eq!(Seq(5), state.time_order);
        assert_eq!(Some(1), state.get_int("hp"));
    }

    #[test]
    fn remove_twice_is_noop() {
        let mut state = state();
        state.apply(&GameStateUpdate::new(Seq(6)).with_attr("hp", Patch::Remove));
        let after_first = state.clone();
        state.apply(&GameStateUpdate::new(Seq(7)).with_attr("hp", Patch::Remove));

        assert_eq!(None, state.get("hp"));
        assert_eq!(after_first.attrs, state.attrs);
    }

    #[test]
    fn merge_is_associative() {
        let u1 = GameStateUpdate::new(Seq(6))
            .with_attr("hp", Patch::set(90i64))
            .with_attr("mana", Patch::set(10i64));
        let u2 = GameStateUpdate::new(Seq(7)).with_attr("hp", Patch::set(80i64));
        let u3 = GameStateUpdate::new(Seq(8))
            .with_attr("mana", Patch::Remove)
            .with_attr("position", Patch::set(1.5));

        let left = u1.clone().merge(u2.clone()).merge(u3.clone());
        let right = u1.merge(u2.merge(u3));
        assert_eq!(left, right);
        assert_eq!(Seq(8), left.time_order);
    }

    #[test]
    fn merged_apply_equals_sequential_apply() {
        let u1 = GameStateUpdate::new(Seq(6))
            .with_attr("hp", Patch::set(90i64))
            .with_attr("mana", Patch::set(10i64));
        let u2 = GameStateUpdate::new(Seq(7))
            .with_attr("mana", Patch::Remove)
            .with_attr("position", Patch::set(2.0));

        let mut sequential = state();
        sequential.apply(&u1);
        sequential.apply(&u2);

        let mut merged = state();
        merged.apply(&u1.merge(u2));

        assert_eq!(sequential, merged);
    }

    #[test]
    fn snapshot_resyncs_a_stale_state() {
        let authoritative = state();
        let mut stale = GameState::new(BTreeMap::from([(
            "hp".to_owned(),
            Value::Int(40),
        )]));
        stale.time_order = Seq(2);

        stale.apply(&GameStateUpdate::snapshot_of(&authoritative));
        assert_eq!(authoritative, stale);
    }
}

//! See [`StateStore`].

use {parking_lot::RwLock, std::collections::VecDeque};

use crate::proto::{
    seq::Seq,
    state::{GameState, GameStateUpdate},
};

/// How many recent updates a [`StateStore`] keeps around by default.
pub const DEFAULT_CACHE_LEN: usize = 100;

/// Thread-safe owner of the authoritative [`GameState`] and a bounded ring
/// of the updates which produced it.
///
/// The simulation loop is the single writer ([`StateStore::push_update`],
/// with strictly increasing time orders); connections are concurrent readers
/// which ask for the composed delta that catches their client up
/// ([`StateStore::updates_since`]). Locks are held only for the duration of
/// the operation, never across user code.
#[derive(Debug)]
pub struct StateStore {
    capacity: usize,
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: GameState,
    /// Recent updates, oldest first.
    cache: VecDeque<GameStateUpdate>,
    /// Time order of the state just before the oldest cached update; a
    /// client at or past this point can be caught up by composing cached
    /// deltas.
    base: Seq,
}

impl StateStore {
    /// Creates a store with the default cache capacity.
    #[must_use]
    pub fn new(initial: GameState) -> Self {
        Self::with_capacity(initial, DEFAULT_CACHE_LEN)
    }

    /// Creates a store keeping at most `capacity` recent updates.
    #[must_use]
    pub fn with_capacity(initial: GameState, capacity: usize) -> Self {
        let base = initial.time_order;
        Self {
            capacity,
            inner: RwLock::new(Inner {
                state: initial,
                cache: VecDeque::with_capacity(capacity),
                base,
            }),
        }
    }

    /// Gets a snapshot of the current authoritative state.
    #[must_use]
    pub fn current_state(&self) -> GameState {
        self.inner.read().state.clone()
    }

    /// Gets the time order of the current authoritative state.
    #[must_use]
    pub fn time_order(&self) -> Seq {
        self.inner.read().state.time_order
    }

    /// Applies `update` to the authoritative state and remembers it for
    /// delta composition, evicting the oldest cached update if over
    /// capacity.
    ///
    /// Callers must push updates with strictly increasing time orders.
    pub fn push_update(&self, update: GameStateUpdate) {
        let mut inner = self.inner.write();
        inner.state.apply(&update);
        inner.cache.push_back(update);
        if inner.cache.len() > self.capacity {
            if let Some(evicted) = inner.cache.pop_front() {
                inner.base = evicted.time_order;
            }
        }
    }

    /// Builds the update which takes a client whose mirror is at `since` to
    /// the current authoritative state.
    ///
    /// If `since` has fallen out of the cache window, the client cannot be
    /// caught up by deltas anymore and a full snapshot update is returned
    /// instead.
    #[must_use]
    pub fn updates_since(&self, since: Seq) -> GameStateUpdate {
        let inner = self.inner.read();
        if since == inner.state.time_order {
            return GameStateUpdate::new(inner.state.time_order);
        }
        if inner.base.newer_than(since) {
            // cache miss; resynchronize from scratch
            return GameStateUpdate::snapshot_of(&inner.state);
        }
        inner
            .cache
            .iter()
            .filter(|update| update.time_order.newer_than(since))
            .cloned()
            .fold(GameStateUpdate::new(inner.state.time_order), |acc, update| {
                acc.merge(update)
            })
    }
}

#[cfg(test)]
mod tests {
    use {
        std::collections::BTreeMap,
        super::*,
        crate::proto::{
            state::{GameStatus, Patch},
            value::Value,
        },
    };

    fn initial() -> GameState {
        GameState::new(BTreeMap::from([("hp".to_owned(), Value::Int(100))]))
    }

    fn update(time_order: u16, key: &str, value: i64) -> GameStateUpdate {
        GameStateUpdate::new(Seq(time_order)).with_attr(key, Patch::set(value))
    }

    #[test]
    fn pushes_advance_the_state() {
        let store = StateStore::new(initial());
        store.push_update(update(1, "hp", 90));
        store.push_update(update(2, "hp", 80));

        let state = store.current_state();
        assert_eq!(Seq(2), state.time_order);
        assert_eq!(Some(80), state.get_int("hp"));
    }

    #[test]
    fn updates_since_zero_replays_everything() {
        let store = StateStore::new(initial());
        store.push_update(update(1, "hp", 90));
        store.push_update(update(2, "mana", 30));
        store.push_update(update(3, "hp", 70));

        let mut replayed = initial();
        replayed.apply(&store.updates_since(Seq::NEVER));
        assert_eq!(store.current_state(), replayed);
    }

    #[test]
    fn updates_since_composes_only_newer_updates() {
        let store = StateStore::new(initial());
        store.push_update(update(1, "hp", 90));
        store.push_update(update(2, "mana", 30));
        store.push_update(update(3, "hp", 70));

        let delta = store.updates_since(Seq(2));
        assert_eq!(Seq(3), delta.time_order);
        assert_eq!(
            BTreeMap::from([("hp".to_owned(), Patch::set(70i64))]),
            delta.attrs
        );
    }

    #[test]
    fn up_to_date_client_gets_an_empty_delta() {
        let store = StateStore::new(initial());
        store.push_update(update(1, "hp", 90));

        let delta = store.updates_since(Seq(1));
        assert_eq!(Seq(1), delta.time_order);
        assert!(delta.attrs.is_empty());
        assert_eq!(None, delta.status);
    }

    #[test]
    fn cache_miss_returns_a_full_snapshot() {
        let store = StateStore::with_capacity(initial(), 4);
        for n in 1..=10u16 {
            store.push_update(update(n, "hp", 100 - i64::from(n)));
        }

        // time order 2 fell out of the 4-update window long ago
        let delta = store.updates_since(Seq(2));
        let mut resynced = GameState::new(BTreeMap::new());
        resynced.apply(&delta);

        let current = store.current_state();
        assert_eq!(current.time_order, resynced.time_order);
        assert_eq!(current.attrs, resynced.attrs);
        assert_eq!(Some(current.status), delta.status);
    }

    #[test]
    fn just_inside_the_window_still_composes() {
        let store = StateStore::with_capacity(initial(), 4);
        for n in 1..=6u16 {
            store.push_update(update(n, "hp", 100 - i64::from(n)));
        }
        // cache holds 3..=6; a client at 2 is exactly at the window base
        let delta = store.updates_since(Seq(2));
        assert_eq!(Seq(6), delta.time_order);
        assert_eq!(None, delta.status, "should be a composed delta, not a snapshot");

        let mut caught_up = initial();
        for n in 1..=2u16 {
            caught_up.apply(&update(n, "hp", 100 - i64::from(n)));
        }
        caught_up.apply(&delta);
        assert_eq!(store.current_state(), caught_up);
    }

    #[test]
    fn status_changes_flow_through_deltas() {
        let store = StateStore::new(initial());
        let mut activate = GameStateUpdate::new(Seq(1));
        activate.status = Some(GameStatus::Active);
        store.push_update(activate);

        assert_eq!(GameStatus::Active, store.current_state().status);
        assert_eq!(
            Some(GameStatus::Active),
            store.updates_since(Seq::NEVER).status
        );
    }
}

//! See [`StateMachine`].

use {
    futures::channel::{mpsc, oneshot},
    std::{net::SocketAddr, sync::Arc},
    tracing::{debug, trace},
    web_time::{Duration, Instant},
};

use crate::{
    events::{AttrPatch, EventHandler, EventHandlerRegistry, HandlerContext},
    proto::{
        event::Event,
        state::{GameState, GameStateUpdate, GameStatus},
    },
    store::StateStore,
};

/// Interval between simulation iterations.
pub const SIMULATION_INTERVAL: Duration = Duration::from_millis(20);

/// User-supplied simulation step: given the current state and the seconds
/// elapsed since the previous iteration, produce the attribute changes for
/// this tick.
pub type TimeStepFn = Box<dyn FnMut(&GameState, f64) -> AttrPatch + Send>;

/// An event pulled off the wire, tagged with the peer which sent it.
#[derive(Debug, Clone)]
pub struct WireEvent {
    /// The received event.
    pub event: Event,
    /// Peer which sent it.
    pub from: SocketAddr,
}

/// Sending half of the event wire: the one-way channel by which connections
/// feed received events into the simulation loop.
pub type EventWire = mpsc::UnboundedSender<WireEvent>;

/// Drives the authoritative simulation.
///
/// Once running, each iteration:
/// 1. drains the event wire, invoking the registered handler per event (each
///    may return an attribute patch);
/// 2. invokes the time step for its own patch;
/// 3. merges all patches in production order (later wins per key) into a
///    single [`GameStateUpdate`] with the next time order, and pushes it to
///    the store.
///
/// [`GameState::status`] is [`GameStatus::Active`] exactly while the loop
/// runs; the loop's start and cooperative stop each push a status-flipping
/// update so every client finds out.
pub struct StateMachine {
    store: Arc<StateStore>,
    handlers: EventHandlerRegistry,
    time_step: TimeStepFn,
    event_wire: EventWire,
    recv_events: mpsc::UnboundedReceiver<WireEvent>,
}

impl core::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StateMachine")
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

impl StateMachine {
    /// Creates a machine simulating the state owned by `store`.
    #[must_use]
    pub fn new(store: Arc<StateStore>, time_step: TimeStepFn) -> Self {
        let (event_wire, recv_events) = mpsc::unbounded();
        Self {
            store,
            handlers: EventHandlerRegistry::new(),
            time_step,
            event_wire,
            recv_events,
        }
    }

    /// Gets a new sending handle to this machine's event wire.
    #[must_use]
    pub fn event_wire(&self) -> EventWire {
        self.event_wire.clone()
    }

    /// Registers a handler invoked inside the simulation loop for events
    /// named `name`, replacing any previous one.
    pub fn register_event_handler(&mut self, name: impl Into<String>, handler: EventHandler) {
        self.handlers.register(name, handler);
    }

    /// Runs the simulation loop until `recv_stop` resolves (or its sender is
    /// dropped). The current iteration always finishes before the loop
    /// exits.
    pub async fn run(mut self, mut recv_stop: oneshot::Receiver<()>) {
        // drop the machine's own wire handle so the receiver terminates once
        // every connection is gone
        drop(self.event_wire);

        let mut status_update = GameStateUpdate::new(self.store.time_order().next());
        status_update.status = Some(GameStatus::Active);
        self.store.push_update(status_update);
        debug!("Simulation loop started");

        let mut last = Instant::now();
        loop {
            let now = Instant::now();
            let dt = now.saturating_duration_since(last).as_secs_f64();
            last = now;

            let snapshot = self.store.current_state();
            let mut update = GameStateUpdate::new(snapshot.time_order.next());

            while let Ok(Some(wire_event)) = self.recv_events.try_next() {
                trace!(
                    "Handling event `{}` from {}",
                    wire_event.event.name, wire_event.from
                );
                let ctx = HandlerContext {
                    game_state: Some(snapshot.clone()),
                    client_addr: Some(wire_event.from),
                    dt: Some(dt),
                };
                if let Some(patch) = self.handlers.handle(&wire_event.event, &ctx).await {
                    update.attrs.extend(patch);
                }
            }

            update.attrs.extend((self.time_step)(&snapshot, dt));
            self.store.push_update(update);

            let sleep_for = SIMULATION_INTERVAL.saturating_sub(last.elapsed());
            tokio::select! {
                _ = &mut recv_stop => break,
                () = tokio::time::sleep(sleep_for) => {}
            }
        }

        let mut status_update = GameStateUpdate::new(self.store.time_order().next());
        status_update.status = Some(GameStatus::Paused);
        self.store.push_update(status_update);
        debug!("Simulation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use {
        std::collections::BTreeMap,
        super::*,
        crate::proto::{seq::Seq, state::Patch, value::Value},
    };

    fn counting_machine(store: Arc<StateStore>) -> StateMachine {
        StateMachine::new(
            store,
            Box::new(|state, _| {
                let ticks = state.get_int("ticks").unwrap_or(0);
                BTreeMap::from([("ticks".to_owned(), Patch::set(ticks + 1))])
            }),
        )
    }

    #[tokio::test]
    async fn loop_advances_time_order_and_status() {
        let store = Arc::new(StateStore::new(GameState::new(BTreeMap::new())));
        let machine = counting_machine(Arc::clone(&store));

        let (send_stop, recv_stop) = oneshot::channel();
        let task = tokio::spawn(machine.run(recv_stop));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let running = store.current_state();
        assert_eq!(GameStatus::Active, running.status);
        assert!(running.time_order.newer_than(Seq(2)));
        assert!(running.get_int("ticks").unwrap_or(0) >= 2);

        send_stop.send(()).unwrap();
        task.await.unwrap();

        let stopped = store.current_state();
        assert_eq!(GameStatus::Paused, stopped.status);
        assert!(stopped.time_order.newer_than(running.time_order));
    }

    #[tokio::test]
    async fn wire_events_reach_their_handler() {
        let store = Arc::new(StateStore::new(GameState::new(BTreeMap::from([(
            "hp".to_owned(),
            Value::Int(100),
        )]))));
        let mut machine = StateMachine::new(Arc::clone(&store), Box::new(|_, _| AttrPatch::new()));
        machine.register_event_handler(
            "ATTACK",
            EventHandler::sync(|event, ctx| {
                let state = ctx.game_state.as_ref()?;
                let damage = event.kwargs.get("damage").and_then(Value::as_int)?;
                Some(BTreeMap::from([(
                    "hp".to_owned(),
                    Patch::set(state.get_int("hp")? - damage),
                )]))
            }),
        );
        let wire = machine.event_wire();

        let (send_stop, recv_stop) = oneshot::channel();
        let task = tokio::spawn(machine.run(recv_stop));

        wire.unbounded_send(WireEvent {
            event: Event::new("ATTACK").with_kwarg("damage", 10i64),
            from: "127.0.0.1:1".parse().unwrap(),
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(Some(90), store.current_state().get_int("hp"));

        send_stop.send(()).unwrap();
        task.await.unwrap();
    }
}

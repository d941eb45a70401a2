#![expect(missing_docs, reason = "testing")]

use {
    stateline::{
        AttrPatch, Backend, Client, Event, EventHandler, GameState, GameStatus, Patch,
        RunningBackend, Seq, Target, Value,
    },
    std::{
        collections::BTreeMap,
        net::SocketAddr,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread::sleep,
        time::{Duration, Instant},
    },
};

fn bind_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn noop_time_step() -> Box<dyn FnMut(&GameState, f64) -> AttrPatch + Send> {
    Box::new(|_, _| AttrPatch::new())
}

/// Polls `check` until it passes or a deadline expires.
fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10));
    }
    panic!("took too long: {what}");
}

fn start_backend(backend: Backend) -> RunningBackend {
    backend.run_in_thread(bind_addr()).unwrap()
}

fn connected_client(addr: SocketAddr) -> Client {
    let mut client = Client::new();
    client.connect(addr).unwrap();
    // wait for the first state synchronization
    wait_until("client never synced", || {
        client.access_game_state().time_order != Seq::NEVER
    });
    client
}

#[test]
fn hello_world() {
    let initial = GameState::new(BTreeMap::from([("hp".to_owned(), Value::Int(100))]));
    let running = start_backend(Backend::new(initial, noop_time_step()));

    let mut client = connected_client(running.local_addr());
    {
        let state = client.access_game_state();
        assert_eq!(Some(100), state.get_int("hp"));
        assert_eq!(GameStatus::Active, state.status);
        assert!(state.time_order.newer_than(Seq::NEVER));
    }

    client.disconnect(true);
    running.join().unwrap();
}

#[test]
fn client_event_patches_the_state() {
    let initial = GameState::new(BTreeMap::from([
        ("hp".to_owned(), Value::Int(100)),
        ("position".to_owned(), Value::Float(0.0)),
    ]));
    let mut backend = Backend::new(initial, noop_time_step());
    backend.register_event_handler(
        "ATTACK",
        EventHandler::sync(|event, ctx| {
            let state = ctx.game_state.as_ref()?;
            let position = state.get_float("position")?;
            let attack_position = event.kwargs.get("attack_position").and_then(Value::as_float)?;
            if (attack_position - position).abs() >= 0.1 {
                return None;
            }
            Some(BTreeMap::from([(
                "hp".to_owned(),
                Patch::set(state.get_int("hp")? - 10),
            )]))
        }),
    );
    let running = start_backend(backend);

    let mut client = connected_client(running.local_addr());
    client
        .dispatch_event(Event::new("ATTACK").with_kwarg("attack_position", 0.05))
        .unwrap();
    wait_until("hp never dropped", || {
        client.access_game_state().get_int("hp") == Some(90)
    });

    // an attack too far away changes nothing
    client
        .dispatch_event(Event::new("ATTACK").with_kwarg("attack_position", 5.0))
        .unwrap();
    sleep(Duration::from_millis(300));
    assert_eq!(Some(90), client.access_game_state().get_int("hp"));

    client.disconnect(true);
    running.join().unwrap();
}

#[test]
fn reliable_event_acks_back_to_the_client() {
    let mut backend = Backend::new(GameState::new(BTreeMap::new()), noop_time_step());
    backend.register_event_handler("PING", EventHandler::sync(|_, _| None));
    let running = start_backend(backend);

    let mut client = connected_client(running.local_addr());
    let acked = Arc::new(AtomicBool::new(false));
    let acked_cb = Arc::clone(&acked);
    client
        .dispatch_event_with(
            Event::new("PING"),
            5,
            Some(Box::new(move || acked_cb.store(true, Ordering::SeqCst))),
            None,
        )
        .unwrap();

    wait_until("ack callback never fired", || acked.load(Ordering::SeqCst));

    client.disconnect(true);
    running.join().unwrap();
}

#[test]
fn server_dispatches_events_to_clients() {
    let running = start_backend(Backend::new(
        GameState::new(BTreeMap::new()),
        noop_time_step(),
    ));

    let pinged = Arc::new(AtomicBool::new(false));
    let pinged_handler = Arc::clone(&pinged);
    let mut client = Client::new();
    client.register_event_handler(
        "PING",
        EventHandler::sync(move |_, _| {
            pinged_handler.store(true, Ordering::SeqCst);
            None
        }),
    );
    client.connect(running.local_addr()).unwrap();
    wait_until("client never synced", || {
        client.access_game_state().time_order != Seq::NEVER
    });

    running
        .server()
        .dispatch_event(Target::All, Event::new("PING"))
        .unwrap();
    wait_until("client never got the event", || pinged.load(Ordering::SeqCst));

    client.disconnect(true);
    running.join().unwrap();
}

#[test]
fn only_the_host_can_shut_the_server_down() {
    let running = start_backend(Backend::new(
        GameState::new(BTreeMap::new()),
        noop_time_step(),
    ));
    let addr = running.local_addr();

    // host connects first, and we make sure the server has seen it before
    // anyone else shows up
    let mut host = connected_client(addr);
    let mut other = connected_client(addr);

    other.disconnect(true);
    sleep(Duration::from_millis(300));
    assert!(running.is_running(), "non-host shutdown should be refused");

    host.disconnect(true);
    wait_until("server never stopped", || !running.is_running());
    running.join().unwrap();
}

#[test]
fn oversize_events_error_at_dispatch() {
    let running = start_backend(Backend::new(
        GameState::new(BTreeMap::new()),
        noop_time_step(),
    ));

    let mut client = connected_client(running.local_addr());
    let huge = Event::new("HUGE").with_arg(Value::Str("x".repeat(4000)));
    assert!(client.dispatch_event(huge.clone()).is_err());
    assert!(
        running
            .server()
            .dispatch_event(Target::All, huge)
            .is_err()
    );

    running.shutdown().unwrap();
}

use {
    ahash::AHashMap,
    bytes::Bytes,
    futures::{StreamExt, channel::mpsc, channel::oneshot},
    octs::{EncodeLen, FixedEncodeLen},
    std::{net::SocketAddr, sync::Arc},
    tokio::net::UdpSocket,
    tracing::{Instrument, debug, debug_span, trace, warn},
    web_time::Instant,
};

use crate::{
    connection::{CallbackMap, apply_effects, dispatch_on_session},
    events::{EventHandlerRegistry, HandlerContext},
    machine::{EventWire, WireEvent},
    proto::{
        event::{Event, SHUTDOWN_EVENT},
        header::Header,
        package::{ServerBody, read_datagram, write_datagram},
        seq::Seq,
        session::{Session, SessionConfig},
    },
    store::StateStore,
};

use super::{Callback, Command, ServerConfig, ServerError, Target};

/// Bytes reserved for body framing around the events when deciding whether
/// an event can ever be sent; covers the fixed part of every body shape.
pub(crate) const BODY_RESERVE: usize = 16;

pub(crate) struct ToOpen {
    pub local_addr: SocketAddr,
    pub send_cmd: mpsc::UnboundedSender<Command>,
}

enum Note {
    /// A peer asked the server to shut down.
    RequestShutdown { from: SocketAddr },
    /// A connection task exited and its peer should be forgotten.
    Closed { addr: SocketAddr },
}

enum ConnCommand {
    Dispatch {
        event: Event,
        retries: u8,
        on_ack: Option<Callback>,
        on_timeout: Option<Callback>,
    },
    Close,
}

struct ConnHandle {
    send_datagram: mpsc::UnboundedSender<Bytes>,
    send_cmd: mpsc::UnboundedSender<ConnCommand>,
    task: tokio::task::JoinHandle<()>,
}

pub(crate) async fn start(
    addr: SocketAddr,
    config: ServerConfig,
    store: Arc<StateStore>,
    handlers: Arc<EventHandlerRegistry>,
    event_wire: EventWire,
    send_open: oneshot::Sender<ToOpen>,
) -> Result<(), ServerError> {
    let socket = UdpSocket::bind(addr).await.map_err(ServerError::Bind)?;
    let local_addr = socket.local_addr().map_err(ServerError::GetLocalAddr)?;
    let socket = Arc::new(socket);
    debug!("Server socket bound to {local_addr}");

    let (send_cmd, mut recv_cmd) = mpsc::unbounded::<Command>();
    send_open
        .send(ToOpen {
            local_addr,
            send_cmd,
        })
        .map_err(|_| ServerError::BackendClosed)?;

    let (send_note, mut recv_note) = mpsc::unbounded::<Note>();
    let mut connections = AHashMap::<SocketAddr, ConnHandle>::new();
    let mut host: Option<SocketAddr> = None;
    let mut buf = vec![0; config.session.max_datagram_len];
    let mut send_closed = None;

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let (len, from) = match recv {
                    Ok(recv) => recv,
                    Err(err) => {
                        debug!("Failed to receive datagram: {err}");
                        continue;
                    }
                };
                let datagram = Bytes::copy_from_slice(&buf[..len]);
                let conn = connections.entry(from).or_insert_with(|| {
                    // the first peer we ever hear from becomes the host
                    let is_host = *host.get_or_insert(from) == from;
                    debug!("New peer {from} (host: {is_host})");
                    spawn_connection(
                        from,
                        Arc::clone(&socket),
                        config.session.clone(),
                        Arc::clone(&store),
                        Arc::clone(&handlers),
                        event_wire.clone(),
                        is_host,
                        send_note.clone(),
                    )
                });
                let _ = conn.send_datagram.unbounded_send(datagram);
            }
            note = recv_note.next() => {
                match note {
                    Some(Note::RequestShutdown { from }) if host == Some(from) => {
                        debug!("Shutdown requested by host {from}");
                        break;
                    }
                    Some(Note::RequestShutdown { from }) => {
                        // connection tasks already filter this; double-check
                        // here in case the host changed under them
                        warn!("Refusing shutdown request from non-host {from}");
                    }
                    Some(Note::Closed { addr }) => {
                        debug!("Forgetting peer {addr}");
                        connections.remove(&addr);
                    }
                    None => break,
                }
            }
            cmd = recv_cmd.next() => {
                match cmd {
                    Some(Command::Dispatch { target, event, retries, on_ack, on_timeout }) => {
                        dispatch(&connections, target, event, retries, on_ack, on_timeout);
                    }
                    Some(Command::Shutdown { send_closed: notify }) => {
                        send_closed = Some(notify);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    debug!("Server shutting down with {} connection(s)", connections.len());
    for (_, conn) in &connections {
        let _ = conn.send_cmd.unbounded_send(ConnCommand::Close);
    }
    for (_, conn) in connections {
        let _ = conn.task.await;
    }
    if let Some(notify) = send_closed {
        let _ = notify.send(());
    }
    Ok(())
}

fn dispatch(
    connections: &AHashMap<SocketAddr, ConnHandle>,
    target: Target,
    event: Event,
    retries: u8,
    on_ack: Option<Callback>,
    on_timeout: Option<Callback>,
) {
    match target {
        Target::All => {
            // callbacks are per-dispatch, not per-peer; they stay with the
            // first connection (arbitrary but stable enough for broadcasts,
            // which rarely want completion callbacks)
            let mut on_ack = on_ack;
            let mut on_timeout = on_timeout;
            for conn in connections.values() {
                let _ = conn.send_cmd.unbounded_send(ConnCommand::Dispatch {
                    event: event.clone(),
                    retries,
                    on_ack: on_ack.take(),
                    on_timeout: on_timeout.take(),
                });
            }
        }
        Target::To(addr) => {
            if let Some(conn) = connections.get(&addr) {
                let _ = conn.send_cmd.unbounded_send(ConnCommand::Dispatch {
                    event,
                    retries,
                    on_ack,
                    on_timeout,
                });
            } else {
                warn!("Dispatched event to unknown peer {addr}");
                if let Some(on_timeout) = on_timeout {
                    on_timeout();
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_connection(
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
    config: SessionConfig,
    store: Arc<StateStore>,
    handlers: Arc<EventHandlerRegistry>,
    event_wire: EventWire,
    is_host: bool,
    send_note: mpsc::UnboundedSender<Note>,
) -> ConnHandle {
    let (send_datagram, recv_datagram) = mpsc::unbounded();
    let (send_cmd, recv_cmd) = mpsc::unbounded();
    let task = tokio::spawn(
        connection(
            addr,
            socket,
            config,
            store,
            handlers,
            event_wire,
            is_host,
            recv_datagram,
            recv_cmd,
            send_note,
        )
        .instrument(debug_span!("connection", peer = %addr)),
    );
    ConnHandle {
        send_datagram,
        send_cmd,
        task,
    }
}

#[allow(clippy::too_many_arguments)]
async fn connection(
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
    config: SessionConfig,
    store: Arc<StateStore>,
    handlers: Arc<EventHandlerRegistry>,
    event_wire: EventWire,
    is_host: bool,
    mut recv_datagram: mpsc::UnboundedReceiver<Bytes>,
    mut recv_cmd: mpsc::UnboundedReceiver<ConnCommand>,
    send_note: mpsc::UnboundedSender<Note>,
) {
    let max_datagram_len = config.max_datagram_len;
    let mut session = Session::new(Instant::now(), config);
    let mut last_client_time_order = Seq::NEVER;
    let mut callbacks = CallbackMap::new();
    let mut interval = tokio::time::interval(session.tick_interval());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                if session.is_dead(now) {
                    debug!("Peer is dead, closing");
                    break;
                }

                apply_effects(session.poll_timeouts(now), &mut callbacks);
                if let Some(quality) = session.update_quality(now) {
                    debug!("Link quality is now {quality:?}");
                    interval = tokio::time::interval(session.tick_interval());
                }

                let mut body = ServerBody {
                    update: store.updates_since(last_client_time_order),
                    events: Vec::new(),
                };
                let budget = max_datagram_len
                    .saturating_sub(Header::ENCODE_LEN + body.encode_len());
                let flush = session.flush(now, budget);
                body.events = flush.events;

                match write_datagram(&flush.header, &body, max_datagram_len) {
                    Ok(datagram) => {
                        if let Err(err) = socket.send_to(&datagram, addr).await {
                            debug!("Failed to send datagram: {err}");
                        }
                    }
                    Err(err) => {
                        // the update alone does not fit; nothing sane to
                        // send this tick
                        warn!("Dropping outgoing package: {err}");
                    }
                }
            }
            datagram = recv_datagram.next() => {
                let Some(datagram) = datagram else { break };
                let now = Instant::now();
                handle_datagram(
                    addr,
                    datagram,
                    now,
                    &mut session,
                    &mut last_client_time_order,
                    &mut callbacks,
                    &store,
                    &handlers,
                    &event_wire,
                    is_host,
                    &send_note,
                )
                .await;
            }
            cmd = recv_cmd.next() => {
                match cmd {
                    Some(ConnCommand::Dispatch { event, retries, on_ack, on_timeout }) => {
                        dispatch_on_session(
                            &mut session,
                            &mut callbacks,
                            event,
                            retries,
                            on_ack,
                            on_timeout,
                        );
                    }
                    Some(ConnCommand::Close) | None => break,
                }
            }
        }
    }

    apply_effects(session.drain_pending(), &mut callbacks);
    let _ = send_note.unbounded_send(Note::Closed { addr });
}

#[allow(clippy::too_many_arguments)]
async fn handle_datagram(
    addr: SocketAddr,
    datagram: Bytes,
    now: Instant,
    session: &mut Session,
    last_client_time_order: &mut Seq,
    callbacks: &mut CallbackMap,
    store: &StateStore,
    handlers: &EventHandlerRegistry,
    event_wire: &EventWire,
    is_host: bool,
    send_note: &mpsc::UnboundedSender<Note>,
) {
    use crate::proto::{package::ClientBody, session::RecvOutcome};

    let (header, body) = match read_datagram::<ClientBody>(datagram) {
        Ok(package) => package,
        Err(err) => {
            debug!("Dropping malformed datagram: {err}");
            return;
        }
    };
    match session.recv(now, &header) {
        RecvOutcome::Duplicate => {
            trace!("Dropping duplicate package {:?}", header.seq);
            return;
        }
        RecvOutcome::Fresh { effects } => apply_effects(effects, callbacks),
    }
    if body.time_order.newer_than(*last_client_time_order) {
        *last_client_time_order = body.time_order;
    }

    for event in body.events {
        if event.name == SHUTDOWN_EVENT {
            if is_host {
                let _ = send_note.unbounded_send(Note::RequestShutdown { from: addr });
            } else {
                debug!("Refusing shutdown request from non-host");
            }
            continue;
        }
        if event.is_reserved() {
            debug!("Dropping reserved event `{}`", event.name);
            continue;
        }
        if handlers.is_registered(&event.name) {
            // receive-path handler; runs here, outside the simulation loop
            let ctx = HandlerContext {
                game_state: Some(store.current_state()),
                client_addr: Some(addr),
                dt: None,
            };
            handlers.handle(&event, &ctx).await;
        } else {
            // game event; the simulation loop will handle (or warn about) it
            let _ = event_wire.unbounded_send(WireEvent { event, from: addr });
        }
    }
}

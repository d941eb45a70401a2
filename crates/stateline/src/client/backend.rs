use {
    bytes::Bytes,
    futures::{StreamExt, channel::mpsc, channel::oneshot},
    octs::{EncodeLen, FixedEncodeLen},
    parking_lot::Mutex,
    std::{net::SocketAddr, sync::Arc},
    tokio::net::UdpSocket,
    tracing::{debug, trace, warn},
    web_time::{Duration, Instant},
};

use crate::{
    connection::{CallbackMap, apply_effects, dispatch_on_session},
    events::{EventHandlerRegistry, HandlerContext},
    proto::{
        event::{Event, SHUTDOWN_EVENT},
        header::Header,
        package::{ClientBody, ServerBody, read_datagram, write_datagram},
        session::{ConnectionStatus, RecvOutcome, Session},
        state::GameState,
    },
};

use super::{ClientCommand, ClientConfig, ClientError};

/// How many copies of the shutdown request a disconnecting host sends, one
/// tick apart. The server treats repeats as duplicates.
const SHUTDOWN_SENDS: usize = 3;

pub(crate) async fn start(
    target: SocketAddr,
    config: ClientConfig,
    handlers: Arc<EventHandlerRegistry>,
    mirror: Arc<Mutex<GameState>>,
    status: Arc<Mutex<ConnectionStatus>>,
    mut recv_cmd: mpsc::UnboundedReceiver<ClientCommand>,
    send_open: oneshot::Sender<Result<(), ClientError>>,
) {
    let socket = match setup_socket(target).await {
        Ok(socket) => socket,
        Err(err) => {
            let _ = send_open.send(Err(err));
            return;
        }
    };
    debug!("Connecting to {target}");
    let _ = send_open.send(Ok(()));

    let max_datagram_len = config.session.max_datagram_len;
    let mut session = Session::new(Instant::now(), config.session);
    let mut callbacks = CallbackMap::new();
    let mut interval = tokio::time::interval(session.tick_interval());
    let mut buf = vec![0; max_datagram_len];

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                *status.lock() = session.status(now);
                if session.is_dead(now) {
                    debug!("Server is dead, closing");
                    break;
                }

                apply_effects(session.poll_timeouts(now), &mut callbacks);
                if let Some(quality) = session.update_quality(now) {
                    debug!("Link quality is now {quality:?}");
                    interval = tokio::time::interval(session.tick_interval());
                }

                send_package(&socket, &mut session, &mirror, max_datagram_len).await;
            }
            recv = socket.recv(&mut buf) => {
                let len = match recv {
                    Ok(len) => len,
                    Err(err) => {
                        // e.g. an ICMP port-unreachable bounced back
                        debug!("Failed to receive datagram: {err}");
                        continue;
                    }
                };
                let datagram = Bytes::copy_from_slice(&buf[..len]);
                handle_datagram(
                    datagram,
                    &mut session,
                    &mut callbacks,
                    &mirror,
                    &status,
                    &handlers,
                )
                .await;
            }
            cmd = recv_cmd.next() => {
                match cmd {
                    Some(ClientCommand::Dispatch { event, retries, on_ack, on_timeout }) => {
                        dispatch_on_session(
                            &mut session,
                            &mut callbacks,
                            event,
                            retries,
                            on_ack,
                            on_timeout,
                        );
                    }
                    Some(ClientCommand::Disconnect { shutdown_server, send_closed }) => {
                        if shutdown_server {
                            debug!("Requesting server shutdown");
                            for _ in 0..SHUTDOWN_SENDS {
                                if session
                                    .dispatch(Event::new(SHUTDOWN_EVENT), 0, false)
                                    .is_ok()
                                {
                                    send_package(&socket, &mut session, &mirror, max_datagram_len)
                                        .await;
                                }
                                tokio::time::sleep(Duration::from_millis(25)).await;
                            }
                        }
                        apply_effects(session.drain_pending(), &mut callbacks);
                        let _ = send_closed.send(());
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    apply_effects(session.drain_pending(), &mut callbacks);
    *status.lock() = ConnectionStatus::Disconnected;
}

async fn setup_socket(target: SocketAddr) -> Result<UdpSocket, ClientError> {
    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await.map_err(ClientError::Bind)?;
    socket.connect(target).await.map_err(ClientError::Connect)?;
    Ok(socket)
}

async fn send_package(
    socket: &UdpSocket,
    session: &mut Session,
    mirror: &Mutex<GameState>,
    max_datagram_len: usize,
) {
    let now = Instant::now();
    let mut body = ClientBody {
        time_order: mirror.lock().time_order,
        events: Vec::new(),
    };
    let budget = max_datagram_len.saturating_sub(Header::ENCODE_LEN + body.encode_len());
    let flush = session.flush(now, budget);
    body.events = flush.events;

    match write_datagram(&flush.header, &body, max_datagram_len) {
        Ok(datagram) => {
            if let Err(err) = socket.send(&datagram).await {
                debug!("Failed to send datagram: {err}");
            }
        }
        Err(err) => {
            warn!("Dropping outgoing package: {err}");
        }
    }
}

async fn handle_datagram(
    datagram: Bytes,
    session: &mut Session,
    callbacks: &mut CallbackMap,
    mirror: &Mutex<GameState>,
    status: &Mutex<ConnectionStatus>,
    handlers: &EventHandlerRegistry,
) {
    let now = Instant::now();
    let (header, body) = match read_datagram::<ServerBody>(datagram) {
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
    *status.lock() = session.status(now);

    let snapshot = {
        let mut mirror = mirror.lock();
        mirror.apply(&body.update);
        mirror.clone()
    };

    for event in body.events {
        if event.is_reserved() {
            debug!("Dropping reserved event `{}`", event.name);
            continue;
        }
        let ctx = HandlerContext {
            game_state: Some(snapshot.clone()),
            client_addr: None,
            dt: None,
        };
        // client-side handlers are for side effects; any patch they return
        // has no authoritative state to flow into
        handlers.handle(&event, &ctx).await;
    }
}

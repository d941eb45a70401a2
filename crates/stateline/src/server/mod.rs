//! Server-side UDP endpoint and per-client connections.

pub(crate) mod backend;

use {
    futures::channel::{mpsc, oneshot},
    std::{io, net::SocketAddr},
};

use crate::proto::{
    event::Event, header::Header, package::SizeOverflow, session::SessionConfig,
};

/// Configuration for a server endpoint.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Per-connection transport configuration.
    pub session: SessionConfig,
}

/// Which peers an event dispatched from the backend is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every connected client.
    All,
    /// One client, by address.
    To(SocketAddr),
}

/// User callback fired on an event acknowledgement or timeout.
///
/// Runs on the connection's task; keep it short.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Error while opening or driving a server endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the UDP socket.
    #[error("failed to bind socket")]
    Bind(#[source] io::Error),
    /// Failed to read the bound socket's local address.
    #[error("failed to get local address")]
    GetLocalAddr(#[source] io::Error),
    /// The backend task is gone; the server has shut down or crashed.
    #[error("backend closed")]
    BackendClosed,
    /// The dispatched event can never fit into a datagram.
    #[error("event too large")]
    EventTooLarge(#[source] SizeOverflow),
}

pub(crate) enum Command {
    Dispatch {
        target: Target,
        event: Event,
        retries: u8,
        on_ack: Option<Callback>,
        on_timeout: Option<Callback>,
    },
    Shutdown {
        send_closed: oneshot::Sender<()>,
    },
}

/// Handle to a running server endpoint.
///
/// Cheap to clone and safe to use from any thread; all operations are
/// forwarded to the backend task.
#[derive(Clone)]
pub struct Server {
    local_addr: SocketAddr,
    max_datagram_len: usize,
    send_cmd: mpsc::UnboundedSender<Command>,
}

impl Server {
    pub(crate) fn new(
        local_addr: SocketAddr,
        max_datagram_len: usize,
        send_cmd: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            local_addr,
            max_datagram_len,
            send_cmd,
        }
    }

    /// Gets the address the server socket is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dispatches a fire-and-forget event to `target`.
    ///
    /// # Errors
    ///
    /// Errors if the event can never fit into a datagram, or if the server
    /// has shut down.
    pub fn dispatch_event(&self, target: Target, event: Event) -> Result<(), ServerError> {
        self.dispatch_event_with(target, event, 0, None, None)
    }

    /// Dispatches an event to `target` with a retry budget and optional
    /// acknowledgement/timeout callbacks.
    ///
    /// If any retries or callbacks are requested, the event is tracked until
    /// its carrying package is acknowledged: `on_ack` fires once it is,
    /// `on_timeout` fires once the retry budget is exhausted instead.
    ///
    /// # Errors
    ///
    /// Errors if the event can never fit into a datagram, or if the server
    /// has shut down.
    pub fn dispatch_event_with(
        &self,
        target: Target,
        event: Event,
        retries: u8,
        on_ack: Option<Callback>,
        on_timeout: Option<Callback>,
    ) -> Result<(), ServerError> {
        check_event_len(&event, self.max_datagram_len).map_err(ServerError::EventTooLarge)?;
        self.send_cmd
            .unbounded_send(Command::Dispatch {
                target,
                event,
                retries,
                on_ack,
                on_timeout,
            })
            .map_err(|_| ServerError::BackendClosed)
    }

    /// Shuts the server down: closes every connection (firing outstanding
    /// timeout callbacks), stops the backend task and closes the socket.
    ///
    /// Blocks until the backend has wound down. Idempotent; shutting down a
    /// server that is already gone does nothing.
    pub fn shutdown(&self) {
        let (send_closed, recv_closed) = oneshot::channel();
        if self
            .send_cmd
            .unbounded_send(Command::Shutdown { send_closed })
            .is_err()
        {
            return;
        }
        let _ = futures::executor::block_on(recv_closed);
    }
}

pub(crate) fn check_event_len(event: &Event, max_datagram_len: usize) -> Result<(), SizeOverflow> {
    use octs::{EncodeLen, FixedEncodeLen};

    let len = Header::ENCODE_LEN + backend::BODY_RESERVE + event.encode_len();
    if len > max_datagram_len {
        return Err(SizeOverflow {
            len,
            max: max_datagram_len,
        });
    }
    Ok(())
}

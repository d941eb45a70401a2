//! Client-side connection and game state mirror.

pub(crate) mod backend;

use {
    futures::channel::{mpsc, oneshot},
    parking_lot::{Mutex, MutexGuard},
    std::{io, net::SocketAddr, sync::Arc},
    tracing::{debug, warn},
};

use crate::{
    events::{EventHandler, EventHandlerRegistry},
    proto::{
        event::Event,
        package::SizeOverflow,
        session::{ConnectionStatus, SessionConfig},
        state::GameState,
    },
    runtime::Runtime,
    server::check_event_len,
};

pub use crate::server::Callback;

/// Configuration for a client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Transport configuration for the single connection.
    pub session: SessionConfig,
}

/// Error while connecting or talking to a backend.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Failed to bind the local UDP socket.
    #[error("failed to bind socket")]
    Bind(#[source] io::Error),
    /// Failed to set the remote address on the socket.
    #[error("failed to connect socket")]
    Connect(#[source] io::Error),
    /// Operation needs a connection, but [`Client::connect`] has not been
    /// called (or the connection is gone).
    #[error("not connected")]
    NotConnected,
    /// The dispatched event can never fit into a datagram.
    #[error("event too large")]
    EventTooLarge(#[source] SizeOverflow),
    /// The connection task is gone.
    #[error("backend closed")]
    BackendClosed,
}

pub(crate) enum ClientCommand {
    Dispatch {
        event: Event,
        retries: u8,
        on_ack: Option<Callback>,
        on_timeout: Option<Callback>,
    },
    Disconnect {
        shutdown_server: bool,
        send_closed: oneshot::Sender<()>,
    },
}

struct Link {
    send_cmd: mpsc::UnboundedSender<ClientCommand>,
}

/// A backend client: one connection plus a local mirror of the replicated
/// game state.
///
/// Register event handlers, then [`Client::connect`]; the connection runs on
/// a background runtime, applying every received server delta to the mirror
/// and dispatching received events to the handlers. Read the mirror through
/// [`Client::access_game_state`].
pub struct Client {
    config: ClientConfig,
    runtime: Runtime,
    /// `Some` until `connect` moves the registry into the connection task.
    handlers: Option<EventHandlerRegistry>,
    mirror: Arc<Mutex<GameState>>,
    status: Arc<Mutex<ConnectionStatus>>,
    link: Option<Link>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Creates a disconnected client with its own background runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_runtime(Runtime::default())
    }

    /// Creates a disconnected client driving its connection on `runtime`.
    #[must_use]
    pub fn with_runtime(runtime: Runtime) -> Self {
        Self {
            config: ClientConfig::default(),
            runtime,
            handlers: Some(EventHandlerRegistry::new()),
            mirror: Arc::new(Mutex::new(GameState::default())),
            status: Arc::new(Mutex::new(ConnectionStatus::Disconnected)),
            link: None,
        }
    }

    /// Sets the transport configuration used by the next
    /// [`Client::connect`].
    pub fn set_config(&mut self, config: ClientConfig) {
        self.config = config;
    }

    /// Registers a handler for events received from the server.
    ///
    /// Handlers must be registered before [`Client::connect`];
    /// registrations after that are ignored with a warning.
    pub fn register_event_handler(&mut self, name: impl Into<String>, handler: EventHandler) {
        if let Some(handlers) = self.handlers.as_mut() {
            handlers.register(name, handler);
        } else {
            warn!("Cannot register event handlers after connecting");
        }
    }

    /// Connects to a backend at `addr`.
    ///
    /// Returns once the local socket is set up and the connection task is
    /// running; the first state synchronization arrives a server tick later.
    /// Connecting an already-connected client does nothing.
    ///
    /// # Errors
    ///
    /// Errors if the local socket cannot be bound or pointed at `addr`.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<(), ClientError> {
        if self.link.is_some() {
            return Ok(());
        }

        let (send_open, recv_open) = oneshot::channel();
        let (send_cmd, recv_cmd) = mpsc::unbounded();
        let handlers = Arc::new(self.handlers.take().unwrap_or_default());
        let backend = backend::start(
            addr,
            self.config.clone(),
            handlers,
            Arc::clone(&self.mirror),
            Arc::clone(&self.status),
            recv_cmd,
            send_open,
        );
        self.runtime.spawn_on_self(async move {
            backend.await;
            debug!("Client backend closed");
        });

        futures::executor::block_on(recv_open).map_err(|_| ClientError::BackendClosed)??;
        self.link = Some(Link { send_cmd });
        Ok(())
    }

    /// Gets how alive the connection currently looks.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Locks and returns the local game state mirror.
    ///
    /// The connection will not apply incoming updates while the guard is
    /// held, so keep the scope short.
    pub fn access_game_state(&self) -> MutexGuard<'_, GameState> {
        self.mirror.lock()
    }

    /// Dispatches a fire-and-forget event to the server.
    ///
    /// # Errors
    ///
    /// Errors if not connected or if the event can never fit a datagram.
    pub fn dispatch_event(&self, event: Event) -> Result<(), ClientError> {
        self.dispatch_event_with(event, 0, None, None)
    }

    /// Dispatches an event with a retry budget and optional
    /// acknowledgement/timeout callbacks, like
    /// [`Server::dispatch_event_with`].
    ///
    /// # Errors
    ///
    /// Errors if not connected or if the event can never fit a datagram.
    ///
    /// [`Server::dispatch_event_with`]: crate::server::Server::dispatch_event_with
    pub fn dispatch_event_with(
        &self,
        event: Event,
        retries: u8,
        on_ack: Option<Callback>,
        on_timeout: Option<Callback>,
    ) -> Result<(), ClientError> {
        check_event_len(&event, self.config.session.max_datagram_len)
            .map_err(ClientError::EventTooLarge)?;
        let link = self.link.as_ref().ok_or(ClientError::NotConnected)?;
        link.send_cmd
            .unbounded_send(ClientCommand::Dispatch {
                event,
                retries,
                on_ack,
                on_timeout,
            })
            .map_err(|_| ClientError::BackendClosed)
    }

    /// Disconnects from the backend.
    ///
    /// With `shutdown_server`, first dispatches the reserved shutdown event;
    /// the server honors it only if this client is the host (the first peer
    /// to have connected). Blocks until the connection task has wound down.
    /// Idempotent.
    pub fn disconnect(&mut self, shutdown_server: bool) {
        if let Some(link) = self.link.take() {
            let (send_closed, recv_closed) = oneshot::channel();
            if link
                .send_cmd
                .unbounded_send(ClientCommand::Disconnect {
                    shutdown_server,
                    send_closed,
                })
                .is_ok()
            {
                let _ = futures::executor::block_on(recv_closed);
            }
        }
        *self.status.lock() = ConnectionStatus::Disconnected;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // closing the command channel lets the connection task wind down on
        // its own; no need to block here
        self.link = None;
    }
}

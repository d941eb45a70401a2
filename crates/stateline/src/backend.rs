//! See [`Backend`].

use {
    futures::channel::oneshot,
    std::{net::SocketAddr, sync::Arc},
    tracing::debug,
};

use crate::{
    events::EventHandler,
    machine::{StateMachine, TimeStepFn},
    proto::state::GameState,
    runtime::Runtime,
    server::{self, Server, ServerConfig, ServerError},
    store::StateStore,
};

/// A complete game backend: authoritative state, simulation loop, and UDP
/// endpoint, wired together.
///
/// Build one with the initial state and a time step, register event
/// handlers, then either [`Backend::run`] (blocking the calling thread until
/// the host client requests shutdown) or [`Backend::run_in_thread`] (serve
/// from a background thread, controlling the server through the returned
/// [`RunningBackend`]).
pub struct Backend {
    config: ServerConfig,
    store: Arc<StateStore>,
    machine: StateMachine,
    server_handlers: crate::events::EventHandlerRegistry,
}

impl Backend {
    /// Creates a backend simulating from `initial_state` with the given time
    /// step.
    #[must_use]
    pub fn new(initial_state: GameState, time_step: TimeStepFn) -> Self {
        let store = Arc::new(StateStore::new(initial_state));
        let machine = StateMachine::new(Arc::clone(&store), time_step);
        Self {
            config: ServerConfig::default(),
            store,
            machine,
            server_handlers: crate::events::EventHandlerRegistry::new(),
        }
    }

    /// Sets the server configuration used when the backend starts serving.
    pub fn set_config(&mut self, config: ServerConfig) {
        self.config = config;
    }

    /// Gets a handle to the authoritative state store.
    #[must_use]
    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    /// Registers a game event handler, invoked inside the simulation loop
    /// with access to `dt` and able to patch the state.
    pub fn register_event_handler(&mut self, name: impl Into<String>, handler: EventHandler) {
        self.machine.register_event_handler(name, handler);
    }

    /// Registers a server-side handler, invoked on the receive path (outside
    /// the simulation loop) as soon as the event arrives. Events with a
    /// server-side handler are not forwarded to the simulation loop.
    pub fn register_server_event_handler(
        &mut self,
        name: impl Into<String>,
        handler: EventHandler,
    ) {
        self.server_handlers.register(name, handler);
    }

    /// Serves on `addr` (port 0 for OS-assigned), blocking the calling
    /// thread until the host client requests shutdown.
    ///
    /// # Errors
    ///
    /// Errors if the socket cannot be bound.
    pub fn run(self, addr: SocketAddr) -> Result<(), ServerError> {
        let runtime = Runtime::default();
        runtime.block_on(self.serve(addr, None))
    }

    /// Serves on `addr` from a background thread.
    ///
    /// Returns once the socket is bound, with a [`RunningBackend`] for
    /// dispatching events and shutting down.
    ///
    /// # Errors
    ///
    /// Errors if the socket cannot be bound.
    pub fn run_in_thread(self, addr: SocketAddr) -> Result<RunningBackend, ServerError> {
        let (send_ready, recv_ready) = std::sync::mpsc::channel();
        let thread = std::thread::spawn(move || {
            let runtime = Runtime::default();
            runtime.block_on(self.serve(addr, Some(send_ready)))
        });
        match recv_ready.recv() {
            Ok(server) => Ok(RunningBackend {
                server,
                thread: Some(thread),
            }),
            // serving never started; surface the bind error
            Err(_) => match thread.join() {
                Ok(Err(err)) => Err(err),
                _ => Err(ServerError::BackendClosed),
            },
        }
    }

    async fn serve(
        self,
        addr: SocketAddr,
        ready: Option<std::sync::mpsc::Sender<Server>>,
    ) -> Result<(), ServerError> {
        let Self {
            config,
            store,
            machine,
            server_handlers,
        } = self;
        let max_datagram_len = config.session.max_datagram_len;
        let event_wire = machine.event_wire();

        let (send_stop, recv_stop) = oneshot::channel();
        let machine_task = tokio::spawn(machine.run(recv_stop));

        let (send_open, recv_open) = oneshot::channel();
        let server_task = tokio::spawn(server::backend::start(
            addr,
            config,
            store,
            Arc::new(server_handlers),
            event_wire,
            send_open,
        ));

        let result = match recv_open.await {
            Ok(open) => {
                let server = Server::new(open.local_addr, max_datagram_len, open.send_cmd);
                debug!("Backend serving on {}", server.local_addr());
                if let Some(ready) = ready {
                    let _ = ready.send(server);
                }
                match server_task.await {
                    Ok(result) => result,
                    Err(_) => Err(ServerError::BackendClosed),
                }
            }
            // the backend task errored before opening; pull out its error
            Err(_) => match server_task.await {
                Ok(Ok(())) | Err(_) => Err(ServerError::BackendClosed),
                Ok(Err(err)) => Err(err),
            },
        };

        let _ = send_stop.send(());
        let _ = machine_task.await;
        result
    }
}

/// Control handle for a backend serving from a background thread.
pub struct RunningBackend {
    server: Server,
    thread: Option<std::thread::JoinHandle<Result<(), ServerError>>>,
}

impl RunningBackend {
    /// Gets the address the backend is serving on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Gets the server handle, for dispatching events to clients.
    #[must_use]
    pub const fn server(&self) -> &Server {
        &self.server
    }

    /// Gets whether the backend is still serving.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Shuts the backend down and waits for the serving thread to finish.
    ///
    /// # Errors
    ///
    /// Errors if serving failed.
    pub fn shutdown(mut self) -> Result<(), ServerError> {
        self.server.shutdown();
        self.join_inner()
    }

    /// Waits for the backend to stop on its own (e.g. by a host client's
    /// shutdown request).
    ///
    /// # Errors
    ///
    /// Errors if serving failed.
    pub fn join(mut self) -> Result<(), ServerError> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<(), ServerError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ServerError::BackendClosed)?,
            None => Ok(()),
        }
    }
}

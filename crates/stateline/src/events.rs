//! Event handler registration and dispatch.

use {
    ahash::AHashMap,
    futures::{FutureExt, future::BoxFuture},
    std::{collections::BTreeMap, net::SocketAddr, panic::AssertUnwindSafe},
    tracing::warn,
};

use crate::proto::{
    event::Event,
    state::{GameState, Patch},
};

/// Attribute changes produced by an event handler or a time step, merged
/// into the tick's state update.
pub type AttrPatch = BTreeMap<String, Patch>;

/// Context injected into an event handler alongside the event's own
/// arguments.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    /// Snapshot of the game state at dispatch time, if one is available
    /// where the handler runs.
    pub game_state: Option<GameState>,
    /// Address of the peer which sent the event, if it arrived over the
    /// wire.
    pub client_addr: Option<SocketAddr>,
    /// Seconds since the previous simulation iteration, if the handler runs
    /// inside the simulation loop.
    pub dt: Option<f64>,
}

type SyncFn = Box<dyn Fn(&Event, &HandlerContext) -> Option<AttrPatch> + Send + Sync>;
type AsyncFn =
    Box<dyn Fn(&Event, &HandlerContext) -> BoxFuture<'static, Option<AttrPatch>> + Send + Sync>;

/// A registered event callback.
///
/// Handlers come in two flavors so user code never has to wrap a plain
/// function into a future (or the other way around); the dispatcher awaits
/// the suspending kind and calls the plain kind directly.
pub enum EventHandler {
    /// Plain synchronous function.
    Sync(SyncFn),
    /// Suspension-capable function returning a future.
    Async(AsyncFn),
}

impl EventHandler {
    /// Creates a handler from a plain function.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Event, &HandlerContext) -> Option<AttrPatch> + Send + Sync + 'static,
    {
        Self::Sync(Box::new(f))
    }

    /// Creates a handler from a function returning a boxed future.
    pub fn async_fn<F>(f: F) -> Self
    where
        F: Fn(&Event, &HandlerContext) -> BoxFuture<'static, Option<AttrPatch>>
            + Send
            + Sync
            + 'static,
    {
        Self::Async(Box::new(f))
    }
}

impl core::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Sync(..)"),
            Self::Async(_) => f.write_str("Async(..)"),
        }
    }
}

/// Maps event names to their handlers.
///
/// One handler per event name; registering a name again replaces the
/// previous handler. Events arriving with no registered handler are logged
/// and ignored. Panics inside a handler are caught at this boundary and
/// logged, so one broken handler cannot kill a connection or the simulation
/// loop.
#[derive(Debug, Default)]
pub struct EventHandlerRegistry {
    handlers: AHashMap<String, EventHandler>,
}

impl EventHandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events named `name`, replacing any previous
    /// handler for that name.
    pub fn register(&mut self, name: impl Into<String>, handler: EventHandler) {
        self.handlers.insert(name.into(), handler);
    }

    /// Gets if a handler is registered for `name`.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Invokes the handler registered for `event`, returning the attribute
    /// patch it produced, if any.
    pub async fn handle(&self, event: &Event, ctx: &HandlerContext) -> Option<AttrPatch> {
        let Some(handler) = self.handlers.get(&event.name) else {
            warn!("No handler registered for event `{}`", event.name);
            return None;
        };
        match handler {
            EventHandler::Sync(f) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| f(event, ctx))) {
                    Ok(patch) => patch,
                    Err(_) => {
                        warn!("Handler for event `{}` panicked", event.name);
                        None
                    }
                }
            }
            EventHandler::Async(f) => {
                match AssertUnwindSafe(f(event, ctx)).catch_unwind().await {
                    Ok(patch) => patch,
                    Err(_) => {
                        warn!("Handler for event `{}` panicked", event.name);
                        None
                    }
                }
            }
        }
    }
}

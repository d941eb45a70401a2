//! Callback bookkeeping shared by the server and client connection tasks.

use {
    ahash::AHashMap,
    tracing::{debug, trace, warn},
};

use crate::{
    proto::{
        event::Event,
        session::{EventKey, Session, SessionEffect},
    },
    server::Callback,
};

/// Completion callbacks for one tracked event dispatch.
pub(crate) struct EventCallbacks {
    pub on_ack: Option<Callback>,
    pub on_timeout: Option<Callback>,
}

/// Table from tracked events to their completion callbacks.
pub(crate) type CallbackMap = AHashMap<EventKey, EventCallbacks>;

/// Fires the callbacks matching a batch of session effects.
///
/// Callbacks run right here, on the connection's task.
pub(crate) fn apply_effects(effects: Vec<SessionEffect>, callbacks: &mut CallbackMap) {
    for effect in effects {
        match effect {
            SessionEffect::EventAcked { key, rtt } => {
                trace!("Event {key:?} acked (rtt {rtt:?})");
                if let Some(cbs) = callbacks.remove(&key) {
                    if let Some(on_ack) = cbs.on_ack {
                        on_ack();
                    }
                }
            }
            SessionEffect::EventLost { key } => {
                debug!("Event {key:?} lost");
                if let Some(cbs) = callbacks.remove(&key) {
                    if let Some(on_timeout) = cbs.on_timeout {
                        on_timeout();
                    }
                }
            }
        }
    }
}

/// Queues a user-dispatched event on `session`, tracking its callbacks if it
/// is reliable.
pub(crate) fn dispatch_on_session(
    session: &mut Session,
    callbacks: &mut CallbackMap,
    event: Event,
    retries: u8,
    on_ack: Option<Callback>,
    on_timeout: Option<Callback>,
) {
    let reliable = retries > 0 || on_ack.is_some() || on_timeout.is_some();
    match session.dispatch(event, retries, reliable) {
        Ok(key) if reliable => {
            callbacks.insert(key, EventCallbacks { on_ack, on_timeout });
        }
        Ok(_) => {}
        Err(err) => {
            // the frontends validate size before enqueueing, so this is
            // unexpected
            warn!("Failed to dispatch event: {err}");
            if let Some(on_timeout) = on_timeout {
                on_timeout();
            }
        }
    }
}

#![doc = include_str!("../README.md")]

pub mod backend;
pub mod client;
pub(crate) mod connection;
pub mod events;
pub mod machine;
pub mod runtime;
pub mod server;
pub mod store;

pub use stateline_proto as proto;

pub use crate::{
    backend::{Backend, RunningBackend},
    client::Client,
    events::{AttrPatch, EventHandler, HandlerContext},
    proto::{
        event::{Event, SHUTDOWN_EVENT},
        seq::Seq,
        session::{ConnectionStatus, LinkQuality, SessionConfig},
        state::{GameState, GameStateUpdate, GameStatus, Patch},
        value::Value,
    },
    server::{Server, Target},
    store::StateStore,
};

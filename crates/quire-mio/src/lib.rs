//! Readiness substrate for quire.
//!
//! Wraps a mio `Poll` so the connection engine can watch sockets and pipes for readiness
//! without knowing anything about the underlying notification mechanism.

mod event_loop;
mod registry;

pub use self::{
    event_loop::run_event_loop,
    registry::{Ready, Registry},
};

pub use mio::{event::Source, Interest, Token};

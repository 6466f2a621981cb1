//! Listener integration.
//!
//! This module ties accepted connections to the shutdown coordinator:
//! the listener adapter counts each connection as an in-flight operation,
//! and the drainer closes idle connections once shutdown begins.

mod drainer;
mod id;
mod listener;

pub use drainer::{Close, ConnectionDrainer, ConnectionState, DrainHandle, DrainStats};
pub use id::ConnectionId;
pub use listener::{Accept, ListenerAdapter, ListenerCloser, TrackedStream, DEFAULT_KEEPALIVE};

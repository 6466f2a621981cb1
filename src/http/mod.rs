//! HTTP serving with graceful shutdown.

mod server;

#[cfg(unix)]
pub use server::bind_unix;
pub use server::{bind, demo_handler, serve, ServeError};

//! softstop - graceful shutdown coordination
//!
//! On a termination request this crate:
//! - stops admitting new work (listeners close, idle connections are dropped)
//! - waits for in-flight operations to finish
//! - escalates to a forced exit on a second request or after a grace period
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use softstop::net::ListenerAdapter;
//! use softstop::shutdown::ShutdownCoordinator;
//! use std::time::Duration;
//!
//! let coordinator = ShutdownCoordinator::new();
//! coordinator.listen_with_timeout(false, Duration::from_secs(180)).await?;
//!
//! let listener = ListenerAdapter::bind("127.0.0.1:3007", &coordinator).await?;
//! while let Ok((stream, _peer)) = listener.accept().await {
//!     tokio::spawn(async move {
//!         // The connection counts as in flight until `stream` is closed or dropped.
//!         drop(stream);
//!     });
//! }
//!
//! coordinator.shutdown_complete().wait().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod echo;
pub mod http;
pub mod metrics;
pub mod net;
pub mod shutdown;
pub mod util;

pub use config::Config;
pub use shutdown::ShutdownCoordinator;

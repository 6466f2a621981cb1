//! HTTP/1.1 server with connection draining.
//!
//! Accepts connections through a [`ListenerAdapter`] and reports each
//! connection's request activity to a [`ConnectionDrainer`], so that on
//! shutdown idle keep-alive connections are closed while in-flight requests
//! run to completion.

use crate::net::{Accept, ConnectionDrainer, ConnectionId, DrainHandle, ListenerAdapter, TrackedStream};
use crate::shutdown::{ShutdownCoordinator, Signal};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

/// Errors raised while setting up an HTTP server.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, io::Error),

    #[cfg(unix)]
    #[error("failed to bind {}: {}", .0.display(), .1)]
    BindUnix(std::path::PathBuf, io::Error),
}

/// Bind an HTTP listener.
///
/// The listener is not closed on shutdown by itself; [`serve`] hands that
/// job to its drainer so the close is ordered with connection transitions.
pub async fn bind(
    addr: SocketAddr,
    coordinator: &ShutdownCoordinator,
) -> Result<ListenerAdapter<TcpListener>, ServeError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServeError::Bind(addr, e))?;

    ListenerAdapter::without_shutdown(listener, coordinator.tracker().clone())
        .map_err(|e| ServeError::Bind(addr, e))
}

/// Bind an HTTP listener on a unix socket. See [`bind`].
#[cfg(unix)]
pub fn bind_unix(
    path: impl AsRef<std::path::Path>,
    coordinator: &ShutdownCoordinator,
) -> Result<ListenerAdapter<tokio::net::UnixListener>, ServeError> {
    let path = path.as_ref();
    let listener = tokio::net::UnixListener::bind(path)
        .map_err(|e| ServeError::BindUnix(path.to_path_buf(), e))?;

    ListenerAdapter::without_shutdown(listener, coordinator.tracker().clone())
        .map_err(|e| ServeError::BindUnix(path.to_path_buf(), e))
}

/// Serve HTTP/1.1 on `listener` until shutdown has drained every connection.
///
/// Hijacked connections are not tracked; handlers that upgrade a connection
/// must watch [`ShutdownCoordinator::shutdown_initiated`] themselves.
#[instrument(skip_all, fields(address = ?listener.local_addr()))]
pub async fn serve<L, H, F>(
    listener: ListenerAdapter<L>,
    coordinator: &ShutdownCoordinator,
    handler: H,
) where
    L: Accept,
    H: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
{
    let drainer = ConnectionDrainer::spawn(coordinator.shutdown_initiated(), listener.closer());
    let drain = drainer.handle();
    info!("http server started");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                spawn_connection(stream, peer, &drain, handler.clone());
            }
            Err(_) if listener.is_closed() => break,
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }

    // Every accepted connection was registered above, before this wait is
    // queued, so none can slip past the drain.
    info!("http listener closed, waiting for connections to drain");
    drainer.drained().await;
    info!("http server drained");
}

/// Register an accepted connection with the drainer and serve it on a new task.
fn spawn_connection<S, A, H, F>(
    stream: TrackedStream<S>,
    peer: A,
    drain: &DrainHandle,
    handler: H,
) -> JoinHandle<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    A: fmt::Debug + Send + 'static,
    H: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
{
    let id = ConnectionId::next();
    let close = Signal::new();
    drain.register(id, close.clone());

    let drain = drain.clone();
    tokio::spawn(async move {
        serve_connection(stream, peer, id, close, drain, handler).await;
    })
}

async fn serve_connection<S, A, H, F>(
    stream: TrackedStream<S>,
    peer: A,
    id: ConnectionId,
    close: Signal,
    drain: DrainHandle,
    handler: H,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    A: fmt::Debug,
    H: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
{
    let service = {
        let drain = drain.clone();
        service_fn(move |req| {
            let drain = drain.clone();
            let handler = handler.clone();
            async move {
                drain.active(id);
                let response = handler(req).await;
                drain.idle(id);
                response
            }
        })
    };

    let conn = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut closing = false;
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            _ = close.wait(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };

    drain.closed(id);

    match result {
        Ok(()) => debug!(connection = %id, peer = ?peer, "connection completed"),
        Err(e) => debug!(connection = %id, peer = ?peer, error = %e, "connection ended with error"),
    }
}

/// Default handler used by the demo binary.
///
/// `/slow` takes two seconds to answer so draining can be observed.
pub async fn demo_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() == "/slow" {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    Ok(Response::new(Full::new(Bytes::from_static(b"Home\n"))))
}

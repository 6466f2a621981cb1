//! Shutdown-aware stream listener.
//!
//! Wraps a listener so that every accepted connection counts as one
//! in-flight operation until it is closed, and so the listener stops
//! admitting connections once shutdown is initiated.

use crate::net::drainer::Close;
use crate::shutdown::{OperationGuard, OperationTracker, ShutdownCoordinator, Signal};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Keep-alive period applied to accepted TCP connections by default.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(180);

/// A listener that can be polled for new connections.
pub trait Accept: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type Addr: fmt::Debug + Clone + Send + Sync + 'static;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, Self::Addr)>>;

    fn local_addr(&self) -> io::Result<Self::Addr>;

    /// Apply transport options to a freshly accepted stream.
    fn configure(_stream: &Self::Stream, _keepalive: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

impl Accept for TcpListener {
    type Stream = TcpStream;
    type Addr = std::net::SocketAddr;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, Self::Addr)>> {
        TcpListener::poll_accept(self, cx)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        TcpListener::local_addr(self)
    }

    fn configure(stream: &TcpStream, keepalive: Option<Duration>) -> io::Result<()> {
        if let Some(period) = keepalive {
            let keepalive = TcpKeepalive::new().with_time(period);
            SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Accept for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, Self::Addr)>> {
        tokio::net::UnixListener::poll_accept(self, cx)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::UnixListener::local_addr(self)
    }
}

/// Listener wrapper that ties accepted connections to an [`OperationTracker`].
pub struct ListenerAdapter<L: Accept> {
    shared: Arc<Shared<L>>,
    tracker: OperationTracker,
    keepalive: Option<Duration>,
    local_addr: L::Addr,
    watcher: Option<JoinHandle<()>>,
}

struct Shared<L> {
    listener: Mutex<Option<L>>,
    closed: Signal,
}

impl<L> Shared<L> {
    /// Drop the listener, releasing its socket. Returns `false` if it was already closed.
    fn close(&self) -> bool {
        let listener = self.listener.lock().take();
        self.closed.fire();
        listener.is_some()
    }
}

impl ListenerAdapter<TcpListener> {
    /// Bind a TCP listener that closes itself when shutdown is initiated.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        coordinator: &ShutdownCoordinator,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::new(listener, coordinator)
    }
}

impl<L: Accept> ListenerAdapter<L> {
    /// Wrap `listener` and close it as soon as shutdown is initiated.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(listener: L, coordinator: &ShutdownCoordinator) -> io::Result<Self> {
        let mut adapter = Self::without_shutdown(listener, coordinator.tracker().clone())?;

        let shared = Arc::clone(&adapter.shared);
        let initiated = coordinator.shutdown_initiated();
        let local_addr = adapter.local_addr.clone();
        adapter.watcher = Some(tokio::spawn(async move {
            initiated.wait().await;
            if shared.close() {
                info!(address = ?local_addr, "shutdown initiated, listener closed");
            }
        }));

        Ok(adapter)
    }

    /// Wrap `listener` without reacting to shutdown.
    ///
    /// The caller is responsible for closing the listener, either directly or
    /// through a [`ListenerCloser`] handed to a drainer.
    pub fn without_shutdown(listener: L, tracker: OperationTracker) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;

        Ok(Self {
            shared: Arc::new(Shared {
                listener: Mutex::new(Some(listener)),
                closed: Signal::new(),
            }),
            tracker,
            keepalive: Some(DEFAULT_KEEPALIVE),
            local_addr,
            watcher: None,
        })
    }

    /// Set the keep-alive period for accepted connections, or disable it.
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Accept the next connection.
    ///
    /// The connection counts as an in-flight operation until it is closed or
    /// dropped. Accept errors are returned as-is; once the listener has been
    /// closed every call fails with `ConnectionAborted`.
    pub async fn accept(&self) -> io::Result<(TrackedStream<L::Stream>, L::Addr)> {
        let (stream, addr) = tokio::select! {
            biased;
            _ = self.shared.closed.wait() => return Err(listener_closed()),
            accepted = poll_fn(|cx| self.poll_accept(cx)) => accepted?,
        };

        if let Err(e) = L::configure(&stream, self.keepalive) {
            warn!(error = %e, peer = ?addr, "failed to configure accepted connection");
        }

        let guard = self.tracker.track();
        debug!(peer = ?addr, in_flight = self.tracker.count(), "connection accepted");

        Ok((TrackedStream::new(stream, guard), addr))
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(L::Stream, L::Addr)>> {
        match self.shared.listener.lock().as_ref() {
            Some(listener) => listener.poll_accept(cx),
            None => Poll::Ready(Err(listener_closed())),
        }
    }

    /// Stop accepting connections. Closing an already closed listener is a no-op.
    pub fn close(&self) -> io::Result<()> {
        self.shared.close();
        Ok(())
    }

    /// Whether the listener has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_set()
    }

    /// Handle that closes this listener from another task.
    pub fn closer(&self) -> ListenerCloser<L> {
        ListenerCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Address the listener was bound to.
    pub fn local_addr(&self) -> &L::Addr {
        &self.local_addr
    }
}

impl<L: Accept> Drop for ListenerAdapter<L> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Closes a [`ListenerAdapter`] from outside the task that accepts on it.
pub struct ListenerCloser<L> {
    shared: Arc<Shared<L>>,
}

impl<L> Clone for ListenerCloser<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L: Send + 'static> Close for ListenerCloser<L> {
    fn close(&self) -> io::Result<()> {
        self.shared.close();
        Ok(())
    }
}

fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed")
}

pin_project! {
    /// A connection accepted through a [`ListenerAdapter`].
    ///
    /// Holds one in-flight operation, released exactly once by [`close`]
    /// or on drop, whichever comes first.
    ///
    /// [`close`]: TrackedStream::close
    #[derive(Debug)]
    pub struct TrackedStream<S> {
        #[pin]
        stream: S,
        guard: Option<OperationGuard>,
    }
}

impl<S> TrackedStream<S> {
    fn new(stream: S, guard: OperationGuard) -> Self {
        Self {
            stream,
            guard: Some(guard),
        }
    }

    /// Whether this connection still counts as in flight.
    pub fn is_tracked(&self) -> bool {
        self.guard.is_some()
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: AsyncWrite + Unpin> TrackedStream<S> {
    /// Shut the stream down and end its operation.
    ///
    /// The operation ends even if the shutdown fails. Further calls do not
    /// touch the operation count.
    pub async fn close(&mut self) -> io::Result<()> {
        let result = self.stream.shutdown().await;
        self.guard.take();
        result
    }
}

impl<S: AsyncRead> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::trigger_source;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn bound(tracker: OperationTracker) -> ListenerAdapter<TcpListener> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ListenerAdapter::without_shutdown(listener, tracker).unwrap()
    }

    #[tokio::test]
    async fn test_accept_tracks_connection_until_close() {
        let tracker = OperationTracker::new();
        let adapter = bound(tracker.clone()).await;
        let addr = *adapter.local_addr();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            stream
        });

        let (mut conn, peer) = adapter.accept().await.unwrap();
        assert_eq!(tracker.count(), 1);
        assert!(conn.is_tracked());
        assert_eq!(conn.get_ref().local_addr().unwrap(), addr);
        assert_eq!(conn.get_ref().peer_addr().unwrap(), peer);

        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.close().await.unwrap();
        assert_eq!(tracker.count(), 0);
        assert!(!conn.is_tracked());

        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_double_close_decrements_once() {
        let tracker = OperationTracker::new();
        let adapter = bound(tracker.clone()).await;
        let addr = *adapter.local_addr();

        // A second tracked operation guards against the counter masking an extra end.
        tracker.begin();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (mut conn, _) = adapter.accept().await.unwrap();
        assert_eq!(tracker.count(), 2);

        let _ = conn.close().await;
        let _ = conn.close().await;
        drop(conn);
        assert_eq!(tracker.count(), 1);

        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases_operation() {
        let tracker = OperationTracker::new();
        let adapter = bound(tracker.clone()).await;
        let addr = *adapter.local_addr();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (conn, _) = adapter.accept().await.unwrap();
        assert_eq!(tracker.count(), 1);

        drop(conn);
        assert_eq!(tracker.count(), 0);
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_rejects_further_accepts() {
        let adapter = bound(OperationTracker::new()).await;
        adapter.close().unwrap();
        adapter.close().unwrap();

        assert!(adapter.is_closed());
        let err = adapter.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_closer_wakes_pending_accept() {
        let adapter = Arc::new(bound(OperationTracker::new()).await);
        let closer = adapter.closer();

        let pending = tokio::spawn({
            let adapter = Arc::clone(&adapter);
            async move { adapter.accept().await.map(|_| ()) }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("pending accept should be woken")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_shutdown_initiated_closes_listener() {
        let coordinator = ShutdownCoordinator::new();
        let (trigger, source) = trigger_source();
        coordinator.register_termination_source(source).unwrap();
        coordinator.register_exit_action(|_code: i32| {}).unwrap();

        let adapter = ListenerAdapter::bind("127.0.0.1:0", &coordinator)
            .await
            .unwrap();
        let addr = *adapter.local_addr();

        coordinator.listen(false).await.unwrap();
        trigger.fire("test");
        coordinator.shutdown_initiated().wait().await;

        let err = adapter.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        // Give the watcher a moment to drop the socket, then expect refusals.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(adapter.is_closed());
        assert!(TcpStream::connect(addr).await.is_err());
    }
}

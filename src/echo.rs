//! Line-agnostic echo service for plain stream listeners.
//!
//! Each connection echoes bytes back until the peer hangs up or shutdown is
//! initiated, at which point the connection is closed by the handler itself.
//! This is the pattern for connections outside any drainer: the owner
//! watches the shutdown-initiated signal.

use crate::net::{Accept, ListenerAdapter, TrackedStream};
use crate::shutdown::SignalWatch;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, instrument};

/// Accept and echo connections until the listener is closed.
#[instrument(skip_all, fields(listener = %name))]
pub async fn serve<L: Accept>(name: &str, listener: ListenerAdapter<L>, initiated: SignalWatch) {
    info!(address = ?listener.local_addr(), "echo listener started");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = ?peer, "echo connection opened");
                let initiated = initiated.clone();
                tokio::spawn(async move {
                    if let Err(e) = echo(stream, initiated).await {
                        debug!(error = %e, "echo connection failed");
                    }
                });
            }
            Err(_) if listener.is_closed() => break,
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }

    info!("echo listener closed");
}

async fn echo<S>(mut stream: TrackedStream<S>, initiated: SignalWatch) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        // Still release the operation before reporting.
                        let _ = stream.close().await;
                        return Err(e);
                    }
                };
                if let Err(e) = stream.write_all(&buf[..n]).await {
                    let _ = stream.close().await;
                    return Err(e);
                }
            }
            _ = initiated.wait() => break,
        }
    }

    stream.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::{OperationTracker, Signal};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_echo_until_shutdown() {
        let tracker = OperationTracker::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let adapter = ListenerAdapter::without_shutdown(listener, tracker.clone()).unwrap();
        let addr = *adapter.local_addr();
        let closer = adapter.closer();
        let initiated = Signal::new();

        let server = tokio::spawn({
            let initiated = initiated.watch();
            async move { serve("test", adapter, initiated).await }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello");
        assert_eq!(tracker.count(), 1);

        initiated.fire();
        crate::net::Close::close(&closer).unwrap();

        tokio::time::timeout(Duration::from_secs(1), tracker.wait_zero())
            .await
            .expect("echo connection should close on shutdown");
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("server should stop once the listener closes")
            .unwrap();

        let mut rest = Vec::new();
        let n = client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);
    }
}

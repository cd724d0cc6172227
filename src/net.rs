//! Backend stream: one type over TCP and unix-socket connections.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

use crate::config::Address;
use crate::errors::Error;

/// A connected backend socket.
pub enum BackendStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Dial a backend address with a connect timeout.
pub async fn connect(address: &Address, timeout: Duration) -> Result<BackendStream, Error> {
    let dial = async {
        match address {
            Address::Tcp(addr) => TcpStream::connect(addr).await.map(|stream| {
                // Latency matters more than throughput on these links.
                let _ = stream.set_nodelay(true);
                BackendStream::Tcp(stream)
            }),
            Address::Unix(path) => UnixStream::connect(path).await.map(BackendStream::Unix),
        }
    };

    match tokio::time::timeout(timeout, dial).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(Error::SocketError(format!(
            "Failed to connect to {address}: {err}"
        ))),
        Err(_) => Err(Error::SocketError(format!(
            "Timed out connecting to {address}"
        ))),
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            BackendStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            BackendStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            BackendStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            BackendStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

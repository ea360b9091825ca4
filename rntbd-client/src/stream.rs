//! Byte stream of a physical connection, plain TCP or TLS.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project! {
    /// Stream to one replica. Split into halves once negotiation may begin.
    #[project = ReplicaStreamProj]
    pub enum ReplicaStream {
        Plain { #[pin] inner: TcpStream },
        Tls { #[pin] inner: Box<TlsStream<TcpStream>> },
    }
}

/// Forwards a poll call to whichever transport is active.
macro_rules! forward {
    ($this:expr, $method:ident($($arg:expr),*)) => {
        match $this.project() {
            ReplicaStreamProj::Plain { inner } => inner.$method($($arg),*),
            ReplicaStreamProj::Tls { inner } => inner.$method($($arg),*),
        }
    };
}

impl ReplicaStream {
    pub fn plain(tcp: TcpStream) -> Self {
        ReplicaStream::Plain { inner: tcp }
    }

    pub fn tls(stream: TlsStream<TcpStream>) -> Self {
        ReplicaStream::Tls {
            inner: Box::new(stream),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ReplicaStream::Tls { .. })
    }
}

impl AsyncRead for ReplicaStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        forward!(self, poll_read(cx, buf))
    }
}

impl AsyncWrite for ReplicaStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        forward!(self, poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        forward!(self, poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        forward!(self, poll_shutdown(cx))
    }
}

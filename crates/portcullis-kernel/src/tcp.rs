//! TCP handler contract.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream carried by a [`TcpConn`].
pub trait ConnStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConnStream for T {}

/// An accepted TCP connection handed down the middleware chain.
pub struct TcpConn {
    remote_addr: SocketAddr,
    stream: Box<dyn ConnStream>,
}

impl TcpConn {
    pub fn new(remote_addr: SocketAddr, stream: impl ConnStream + 'static) -> Self {
        Self {
            remote_addr,
            stream: Box::new(stream),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stream_mut(&mut self) -> &mut (dyn ConnStream + 'static) {
        self.stream.as_mut()
    }

    pub fn into_stream(self) -> Box<dyn ConnStream> {
        self.stream
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// A connection handler in the TCP middleware chain.
#[async_trait]
pub trait TcpHandler: Send + Sync {
    /// Serves one connection until it is done with it.
    async fn serve_tcp(&self, conn: TcpConn) -> io::Result<()>;
}

/// Shared handle on a TCP handler.
pub type SharedTcpHandler = Arc<dyn TcpHandler>;

struct TcpHandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TcpHandler for TcpHandlerFn<F>
where
    F: Fn(TcpConn) -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    async fn serve_tcp(&self, conn: TcpConn) -> io::Result<()> {
        (self.f)(conn).await
    }
}

/// Wraps an async closure as a TCP handler.
pub fn tcp_handler_fn<F, Fut>(f: F) -> SharedTcpHandler
where
    F: Fn(TcpConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    Arc::new(TcpHandlerFn { f })
}

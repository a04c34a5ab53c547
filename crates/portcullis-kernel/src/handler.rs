//! HTTP handler contract.
//!
//! Requests and responses are fully buffered `http` types. The peer address
//! travels as a [`RemoteAddr`] request extension.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Buffered HTTP request.
pub type HttpRequest = ::http::Request<Bytes>;

/// Buffered HTTP response.
pub type HttpResponse = ::http::Response<Bytes>;

/// Peer address of the connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reads the [`RemoteAddr`] extension of a request.
pub fn remote_addr(req: &HttpRequest) -> Option<SocketAddr> {
    req.extensions().get::<RemoteAddr>().map(|addr| addr.0)
}

/// A request handler in the middleware chain.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    /// Serves one request.
    async fn serve_http(&self, req: HttpRequest) -> HttpResponse;
}

/// Shared handle on a handler.
pub type SharedHttpHandler = Arc<dyn HttpHandler>;

struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> HttpHandler for HandlerFn<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    async fn serve_http(&self, req: HttpRequest) -> HttpResponse {
        (self.f)(req).await
    }
}

/// Wraps an async closure as a handler.
///
/// # Example
///
/// ```rust,ignore
/// let next = handler_fn(|_req| async { HttpResponse::new(Bytes::from_static(b"ok")) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> SharedHttpHandler
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    Arc::new(HandlerFn { f })
}

/// Builds a response with the given status and body.
pub fn text_response(status: ::http::StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut resp = HttpResponse::new(body.into());
    *resp.status_mut() = status;
    resp
}

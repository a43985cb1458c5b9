// hyper glue for serving a tonic service over a unix socket without going
// through tonic's own transport

use futures::future::{ready, Ready};
use hyper::{server::accept::Accept, Body, Request, Response};
use std::{
  convert::Infallible,
  io,
  path::Path,
  pin::Pin,
  task::{Context, Poll},
};
use tokio::net::{UnixListener, UnixStream};
use tonic::body::BoxBody;
use tower::Service;
use tracing::{instrument::Instrumented, Instrument, Span};

pub(crate) struct UnixSocketListener(UnixListener);

impl UnixSocketListener {
  pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
    UnixListener::bind(path).map(Self)
  }
}

impl Accept for UnixSocketListener {
  type Conn = UnixStream;
  type Error = io::Error;

  fn poll_accept(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Result<Self::Conn, Self::Error>>> {
    match self.0.poll_accept(cx) {
      Poll::Pending => Poll::Pending,
      Poll::Ready(Ok((stream, _))) => Poll::Ready(Some(Ok(stream))),
      Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
    }
  }
}

/// Wraps a grpc service so every request runs inside the span that was
/// current when the server was started. Doubles as its own make-service.
#[derive(Clone)]
pub(crate) struct Svc<S> {
  inner: S,
  span: Span,
}

impl<S> Svc<S> {
  pub fn new(inner: S, span: Span) -> Self {
    Self { inner, span }
  }
}

impl<S> Service<Request<Body>> for Svc<S>
where
  S: Service<Request<Body>, Response = Response<BoxBody>, Error = Infallible>,
{
  type Response = Response<BoxBody>;
  type Error = Infallible;
  type Future = Instrumented<S::Future>;

  fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    self.inner.poll_ready(cx)
  }

  fn call(&mut self, req: Request<Body>) -> Self::Future {
    self.inner.call(req).instrument(self.span.clone())
  }
}

impl<'a, S> Service<&'a UnixStream> for Svc<S>
where
  S: Clone,
{
  type Response = Self;
  type Error = Infallible;
  type Future = Ready<Result<Self::Response, Self::Error>>;

  fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    Poll::Ready(Ok(()))
  }

  fn call(&mut self, _: &'a UnixStream) -> Self::Future {
    ready(Ok(self.clone()))
  }
}

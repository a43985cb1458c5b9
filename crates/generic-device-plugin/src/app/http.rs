use crate::{metrics::Metrics, utils::Shutdown};
use hyper::{
  header::{HeaderValue, CONTENT_TYPE},
  service::{make_service_fn, service_fn},
  Body, Method, Request, Response, Server, StatusCode,
};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tracing::{event, Level};

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

fn respond(metrics: &Metrics, request: &Request<Body>) -> Response<Body> {
  let mut response = Response::new(Body::empty());
  match (request.method(), request.uri().path()) {
    (&Method::GET, "/health") => {}
    (&Method::GET, "/metrics") => {
      response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(METRICS_CONTENT_TYPE));
      *response.body_mut() = Body::from(metrics.render());
    }
    _ => *response.status_mut() = StatusCode::NOT_FOUND,
  }

  response
}

/// Serves `/health` and `/metrics` on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>, shutdown: Shutdown) -> hyper::Result<()> {
  let make_service = make_service_fn(move |_| {
    let metrics = Arc::clone(&metrics);
    async move {
      Ok::<_, Infallible>(service_fn(move |request| {
        let response = respond(&metrics, &request);
        async move { Ok::<_, Infallible>(response) }
      }))
    }
  });

  let server = Server::try_bind(&addr)?.serve(make_service);
  event!(
    target: "generic-device-plugin",
    Level::INFO,
    addr = %server.local_addr(),
    "serving health and metrics");

  server
    .with_graceful_shutdown(async move { shutdown.wait().await })
    .await
}

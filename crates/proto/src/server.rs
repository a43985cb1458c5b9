use futures::future::FusedFuture;
use pin_project::pin_project;
use static_assertions::assert_impl_all;
use std::{
  fmt,
  future::Future,
  panic,
  path::{Path, PathBuf},
  pin::Pin,
  task::{Context, Poll},
  time::Duration,
};
use tokio::{
  sync::oneshot,
  task::{JoinError, JoinHandle},
};
use tracing::{event, Level};

/// Resolves once the owning [`KubernetesDevicePluginServer`] asks the
/// server to shut down, or once the handle is dropped.
#[pin_project]
pub struct Signal(#[pin] oneshot::Receiver<()>);

impl Future for Signal {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match self.project().0.poll(cx) {
      Poll::Pending => Poll::Pending,
      Poll::Ready(_) => Poll::Ready(()),
    }
  }
}

/// Handle to a running device plugin grpc server bound to a unix socket.
///
/// Awaiting the handle waits for the server to exit on its own.
pub struct KubernetesDevicePluginServer {
  socket_path: PathBuf,
  shutdown: Option<oneshot::Sender<()>>,
  handle: JoinHandle<hyper::Result<()>>,
  terminated: bool,
}

assert_impl_all!(KubernetesDevicePluginServer: Unpin, Send);

impl fmt::Debug for KubernetesDevicePluginServer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct(stringify!(KubernetesDevicePluginServer))
      .field("socket_path", &self.socket_path)
      .field("terminated", &self.terminated)
      .finish_non_exhaustive()
  }
}

fn join_result(result: Result<hyper::Result<()>, JoinError>) -> hyper::Result<()> {
  match result {
    Ok(result) => result,
    Err(e) if e.is_cancelled() => Ok(()),
    Err(e) => panic::resume_unwind(e.into_panic()),
  }
}

impl KubernetesDevicePluginServer {
  pub(crate) fn start(
    socket_path: PathBuf,
    f: impl FnOnce(Signal) -> JoinHandle<hyper::Result<()>>,
  ) -> Self {
    let (shutdown, receiver) = oneshot::channel::<()>();
    let handle = f(Signal(receiver));

    Self {
      socket_path,
      shutdown: Some(shutdown),
      handle,
      terminated: false,
    }
  }

  /// Path of the unix socket the server listens on.
  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }

  /// Asks the server to stop accepting connections and waits up to `grace`
  /// for in-flight calls to finish. Long-lived streams (ListAndWatch) never
  /// finish on their own, so the task is cancelled once `grace` runs out.
  pub async fn abort(mut self, grace: Duration) -> hyper::Result<()> {
    if self.terminated {
      return Ok(());
    }

    if let Some(shutdown) = self.shutdown.take() {
      let _ = shutdown.send(());
    }

    match tokio::time::timeout(grace, &mut self.handle).await {
      Ok(result) => join_result(result),
      Err(_) => {
        event!(
          target: "kubelet-deviceplugin",
          Level::DEBUG,
          socket = %self.socket_path.display(),
          "graceful shutdown timed out, cancelling server task");
        self.handle.abort();
        join_result((&mut self.handle).await)
      }
    }
  }

  pub fn is_terminated(&self) -> bool {
    self.terminated
  }
}

impl Future for KubernetesDevicePluginServer {
  type Output = hyper::Result<()>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    if this.terminated {
      return Poll::Pending;
    }

    match Pin::new(&mut this.handle).poll(cx) {
      Poll::Pending => Poll::Pending,
      Poll::Ready(result) => {
        this.terminated = true;
        Poll::Ready(join_result(result))
      }
    }
  }
}

impl FusedFuture for KubernetesDevicePluginServer {
  fn is_terminated(&self) -> bool {
    self.terminated
  }
}

pub mod proto;
mod types;

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use hyper::{Server, Uri};
use std::{
  io,
  path::{Path, PathBuf},
  pin::Pin,
  sync::Arc,
  time::Duration,
};
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::{transport::Endpoint, Status};
use tower::service_fn;
use tracing::{event, span, Instrument, Level, Span};

pub use types::*;

use crate::{
  transport::{Svc, UnixSocketListener},
  KubernetesDevicePluginServer,
};

/// Means that the device is healthy.
pub const HEALTHY: &str = "Healthy";

/// Means that the device is unhealthy.
pub const UNHEALTHY: &str = "Unhealthy";

/// Means current version of the API supported by kubelet.
pub const VERSION: &str = "v1beta1";

/// The folder the Device Plugin is expecting sockets to be on. Only
/// privileged pods have access to this path.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// File name of the kubelet registration socket inside the plugin folder.
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Timeout duration in secs for PreStartContainer RPC.
pub const KUBELET_PRE_START_CONTAINER_RPC_TIMEOUT_IN_SECS: Duration = Duration::from_secs(30);

/// How long [`KubernetesDevicePluginServer::abort`] waits when a failed
/// registration tears the freshly started server down again.
const REGISTRATION_ABORT_GRACE: Duration = Duration::from_millis(500);

/// A device plugin as seen by kubelet.
///
/// Only ListAndWatch and Allocate are mandatory. The optional calls are
/// advertised through the two associated constants; leaving them `false`
/// keeps the defaults below, which kubelet never calls.
#[async_trait]
pub trait DevicePlugin: Send + Sync + 'static {
  /// Indicates if PreStartContainer call is required before each container start.
  const PRE_START_REQUIRED: bool = false;

  /// Indicates if GetPreferredAllocation is implemented and available for calling.
  const GET_PREFERRED_ALLOCATION_AVAILABLE: bool = false;

  type ListAndWatchStream: Stream<Item = Result<ListAndWatchResponse, Status>> + Send + 'static;

  /// ListAndWatch returns a stream of List of Devices
  /// Whenever a Device state change or a Device disappears, ListAndWatch
  /// returns the new list
  async fn list_and_watch(&self) -> Result<Self::ListAndWatchStream, Status>;

  /// Allocate is called during container creation so that the Device
  /// Plugin can run device specific operations and instruct Kubelet
  /// of the steps to make the Device available in the container
  async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse, Status>;

  async fn prestart_container(&self, _request: PreStartContainerRequest) -> Result<(), Status> {
    Ok(())
  }

  async fn get_preferred_allocation(
    &self,
    _request: PreferredAllocationRequest,
  ) -> Result<PreferredAllocationResponse, Status> {
    Err(Status::unimplemented(
      "get_preferred_allocation not supported",
    ))
  }
}

/// Adapts a [`DevicePlugin`] to the generated grpc service and knows how to
/// announce it to kubelet.
pub struct KubeletDevicePluginV1Beta1<T: DevicePlugin>(Arc<T>);

impl<T: DevicePlugin> Clone for KubeletDevicePluginV1Beta1<T> {
  fn clone(&self) -> Self {
    Self(Arc::clone(&self.0))
  }
}

impl<T: DevicePlugin> KubeletDevicePluginV1Beta1<T> {
  pub fn new(plugin: T) -> Self {
    Self(Arc::new(plugin))
  }

  pub fn from_arc(plugin: Arc<T>) -> Self {
    Self(plugin)
  }

  fn options() -> proto::DevicePluginOptions {
    proto::DevicePluginOptions {
      pre_start_required: T::PRE_START_REQUIRED,
      get_preferred_allocation_available: T::GET_PREFERRED_ALLOCATION_AVAILABLE,
    }
  }
}

type ListAndWatchProtoStream =
  dyn Stream<Item = Result<proto::ListAndWatchResponse, Status>> + Send + 'static;

#[async_trait]
impl<T: DevicePlugin> proto::device_plugin_server::DevicePlugin for KubeletDevicePluginV1Beta1<T> {
  type ListAndWatchStream = Pin<Box<ListAndWatchProtoStream>>;

  async fn get_device_plugin_options(
    &self,
    _: tonic::Request<proto::Empty>,
  ) -> Result<tonic::Response<proto::DevicePluginOptions>, Status> {
    Ok(tonic::Response::new(Self::options()))
  }

  async fn list_and_watch(
    &self,
    _: tonic::Request<proto::Empty>,
  ) -> Result<tonic::Response<Self::ListAndWatchStream>, Status> {
    let stream = self.0.list_and_watch().await?;
    let mapped = stream.map_ok(proto::ListAndWatchResponse::from);

    Ok(tonic::Response::new(Box::pin(mapped)))
  }

  async fn get_preferred_allocation(
    &self,
    request: tonic::Request<proto::PreferredAllocationRequest>,
  ) -> Result<tonic::Response<proto::PreferredAllocationResponse>, Status> {
    let response = self
      .0
      .get_preferred_allocation(request.into_inner().into())
      .await?;

    Ok(tonic::Response::new(response.into()))
  }

  async fn allocate(
    &self,
    request: tonic::Request<proto::AllocateRequest>,
  ) -> Result<tonic::Response<proto::AllocateResponse>, Status> {
    let response = self.0.allocate(request.into_inner().into()).await?;

    Ok(tonic::Response::new(response.into()))
  }

  async fn pre_start_container(
    &self,
    request: tonic::Request<proto::PreStartContainerRequest>,
  ) -> Result<tonic::Response<proto::PreStartContainerResponse>, Status> {
    self.0.prestart_container(request.into_inner().into()).await?;

    Ok(tonic::Response::new(proto::PreStartContainerResponse {}))
  }
}

/// Picks `<slug>.sock` inside `plugin_dir`, falling back to `<slug>-N.sock`
/// while the name is taken.
fn socket_path_for(plugin_dir: &Path, resource_name: &str) -> PathBuf {
  let stem = slug::slugify(resource_name);
  let mut index = 0usize;
  loop {
    let file_name = match index {
      0 => format!("{}.sock", stem),
      v => format!("{}-{}.sock", stem, v),
    };

    let path = plugin_dir.join(file_name);
    if !path.exists() {
      break path;
    }

    index += 1;
  }
}

impl<T: DevicePlugin> KubeletDevicePluginV1Beta1<T> {
  /// Serves the plugin on a fresh unix socket in `plugin_dir` and registers
  /// it with the kubelet listening on `plugin_dir/kubelet.sock`.
  ///
  /// When registration fails the server is torn down and its socket removed
  /// before the error is returned.
  pub async fn start(
    self,
    resource_name: impl Into<String>,
    plugin_dir: impl AsRef<Path>,
  ) -> Result<KubernetesDevicePluginServer, ConnectionError> {
    let resource_name: String = resource_name.into();
    let span = span!(
      Level::INFO,
      "deviceplugin-v1beta1",
      resource = &*resource_name,
    );

    self
      ._start(resource_name, plugin_dir.as_ref())
      .instrument(span)
      .await
  }

  async fn _start(
    self,
    resource_name: String,
    plugin_dir: &Path,
  ) -> Result<KubernetesDevicePluginServer, ConnectionError> {
    let socket_path = socket_path_for(plugin_dir, &resource_name);
    let endpoint = socket_path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default();

    let listener = UnixSocketListener::bind(&socket_path).map_err(|source| ConnectionError::Bind {
      path: socket_path.clone(),
      source,
    })?;

    let service = proto::device_plugin_server::DevicePluginServer::new(self);
    let span = Span::current();
    let server = KubernetesDevicePluginServer::start(socket_path.clone(), move |signal| {
      tokio::spawn(
        Server::builder(listener)
          .http2_only(true)
          .serve(Svc::new(service, span))
          .with_graceful_shutdown(signal),
      )
    });

    event!(
      target: "kubelet-deviceplugin",
      Level::DEBUG,
      socket = %socket_path.display(),
      "device plugin server listening");

    match register(plugin_dir.join(KUBELET_SOCKET_NAME), endpoint, resource_name, Self::options()).await {
      Ok(()) => Ok(server),
      Err(e) => {
        let _ = server.abort(REGISTRATION_ABORT_GRACE).await;
        let _ = tokio::fs::remove_file(&socket_path).await;
        Err(e)
      }
    }
  }
}

async fn register(
  kubelet_socket: PathBuf,
  endpoint: String,
  resource_name: String,
  options: proto::DevicePluginOptions,
) -> Result<(), ConnectionError> {
  // the uri is ignored by the connector, every connection goes to the socket
  let channel = Endpoint::from_static("http://[::]:50051")
    .connect_with_connector(service_fn(move |_: Uri| {
      UnixStream::connect(kubelet_socket.clone())
    }))
    .await?;

  let mut kubelet_client = proto::registration_client::RegistrationClient::new(channel);
  kubelet_client
    .register(proto::RegisterRequest {
      version: VERSION.into(),
      endpoint: endpoint.clone(),
      resource_name,
      options: Some(options),
    })
    .await?;

  event!(
    target: "kubelet-deviceplugin",
    Level::INFO,
    endpoint = %endpoint,
    "registered with kubelet");

  Ok(())
}

#[derive(Debug, Error)]
pub enum ConnectionError {
  #[error("failed to bind device plugin socket {path:?}")]
  Bind {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Transport(#[from] tonic::transport::Error),

  #[error("kubelet rejected registration: {0}")]
  Status(#[from] Status),

  #[error(transparent)]
  Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::stream;
  use std::sync::Mutex;
  use tokio::{net::UnixListener, sync::oneshot};
  use tokio_stream::wrappers::UnixListenerStream;

  struct FixedPlugin;

  #[async_trait]
  impl DevicePlugin for FixedPlugin {
    type ListAndWatchStream = stream::Iter<std::vec::IntoIter<Result<ListAndWatchResponse, Status>>>;

    async fn list_and_watch(&self) -> Result<Self::ListAndWatchStream, Status> {
      let response = ListAndWatchResponse {
        devices: vec![Device {
          id: "dev-0".into(),
          health: DeviceHealth::Healthy,
          topology: None,
        }],
      };

      Ok(stream::iter(vec![Ok(response)]))
    }

    async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse, Status> {
      let container_responses = request
        .container_requests
        .into_iter()
        .map(|container| ContainerAllocateResponse {
          devices: container
            .device_ids
            .into_iter()
            .map(|id| DeviceSpec {
              container_path: format!("/dev/{}", id),
              host_path: format!("/dev/{}", id),
              permissions: "rw".into(),
            })
            .collect(),
          ..Default::default()
        })
        .collect();

      Ok(AllocateResponse {
        container_responses,
      })
    }
  }

  struct FakeKubelet {
    accept: bool,
    seen: Mutex<Vec<proto::RegisterRequest>>,
  }

  #[async_trait]
  impl proto::registration_server::Registration for Arc<FakeKubelet> {
    async fn register(
      &self,
      request: tonic::Request<proto::RegisterRequest>,
    ) -> Result<tonic::Response<proto::Empty>, Status> {
      self.seen.lock().unwrap().push(request.into_inner());
      if self.accept {
        Ok(tonic::Response::new(proto::Empty {}))
      } else {
        Err(Status::invalid_argument("resource already registered"))
      }
    }
  }

  fn serve_kubelet(dir: &Path, accept: bool) -> (Arc<FakeKubelet>, oneshot::Sender<()>) {
    let kubelet = Arc::new(FakeKubelet {
      accept,
      seen: Mutex::new(Vec::new()),
    });
    let listener = UnixListener::bind(dir.join(KUBELET_SOCKET_NAME)).unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let service = proto::registration_server::RegistrationServer::new(kubelet.clone());
    tokio::spawn(
      tonic::transport::Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async {
          let _ = stopped.await;
        }),
    );

    (kubelet, stop)
  }

  async fn plugin_client(
    socket: PathBuf,
  ) -> proto::device_plugin_client::DevicePluginClient<tonic::transport::Channel> {
    let channel = Endpoint::from_static("http://[::]:50051")
      .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(socket.clone())))
      .await
      .unwrap();

    proto::device_plugin_client::DevicePluginClient::new(channel)
  }

  #[test]
  fn socket_names_are_slugged_and_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let first = socket_path_for(dir.path(), "squat.ai/serial");
    assert_eq!(first, dir.path().join("squat-ai-serial.sock"));

    std::fs::write(&first, b"").unwrap();
    let second = socket_path_for(dir.path(), "squat.ai/serial");
    assert_eq!(second, dir.path().join("squat-ai-serial-1.sock"));
  }

  #[tokio::test]
  async fn registers_and_serves_the_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let (kubelet, _stop) = serve_kubelet(dir.path(), true);

    let server = KubeletDevicePluginV1Beta1::new(FixedPlugin)
      .start("squat.ai/fuse", dir.path())
      .await
      .unwrap();

    {
      let seen = kubelet.seen.lock().unwrap();
      assert_eq!(seen.len(), 1);
      assert_eq!(seen[0].version, VERSION);
      assert_eq!(seen[0].resource_name, "squat.ai/fuse");
      assert_eq!(seen[0].endpoint, "squat-ai-fuse.sock");
      assert_eq!(
        seen[0].options,
        Some(proto::DevicePluginOptions {
          pre_start_required: false,
          get_preferred_allocation_available: false,
        })
      );
    }

    let mut client = plugin_client(server.socket_path().to_owned()).await;

    let mut updates = client
      .list_and_watch(proto::Empty {})
      .await
      .unwrap()
      .into_inner();
    let first = updates.message().await.unwrap().unwrap();
    assert_eq!(first.devices[0].id, "dev-0");
    assert_eq!(first.devices[0].health, HEALTHY);

    let allocated = client
      .allocate(proto::AllocateRequest {
        container_requests: vec![proto::ContainerAllocateRequest {
          devices_i_ds: vec!["fuse".into()],
        }],
      })
      .await
      .unwrap()
      .into_inner();
    assert_eq!(allocated.container_responses[0].devices[0].host_path, "/dev/fuse");

    let preferred = client
      .get_preferred_allocation(proto::PreferredAllocationRequest::default())
      .await
      .unwrap_err();
    assert_eq!(preferred.code(), tonic::Code::Unimplemented);

    server.abort(Duration::from_secs(1)).await.unwrap();
  }

  #[tokio::test]
  async fn rejected_registration_removes_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let (_kubelet, _stop) = serve_kubelet(dir.path(), false);

    let error = KubeletDevicePluginV1Beta1::new(FixedPlugin)
      .start("squat.ai/fuse", dir.path())
      .await
      .unwrap_err();

    assert!(matches!(error, ConnectionError::Status(_)));
    assert!(!dir.path().join("squat-ai-fuse.sock").exists());
  }
}

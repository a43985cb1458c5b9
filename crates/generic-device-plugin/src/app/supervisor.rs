use super::device_plugin::DevicePlugin;
use crate::{inventory::Inventory, metrics::ResourceMetrics, utils::Shutdown};
use kubelet_deviceplugin_proto::{
  v1beta1::{self, ConnectionError},
  KubernetesDevicePluginServer,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tracing::{event, Level};

/// How often the plugin socket is checked for removal.
const SOCKET_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Pause between a failure and the next registration attempt.
const RESTART_BACKOFF: Duration = Duration::from_secs(5);
/// Time in-flight calls get to finish when the server is stopped.
const ABORT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
  #[error("failed to start device plugin server")]
  Start(#[from] ConnectionError),

  #[error("device plugin server exited")]
  Exited(#[source] Option<hyper::Error>),

  #[error("device plugin socket {0:?} was removed")]
  SocketRemoved(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
  pub plugin_dir: PathBuf,
  pub socket_check_interval: Duration,
  pub restart_backoff: Duration,
  pub abort_grace: Duration,
}

impl SupervisorOptions {
  pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
    Self {
      plugin_dir: plugin_dir.into(),
      socket_check_interval: SOCKET_CHECK_INTERVAL,
      restart_backoff: RESTART_BACKOFF,
      abort_grace: ABORT_GRACE,
    }
  }
}

/// Keeps one resource registered with kubelet until shut down.
pub struct Supervisor {
  plugin: Arc<DevicePlugin>,
  inventory: Inventory,
  metrics: Arc<ResourceMetrics>,
  options: SupervisorOptions,
}

enum Exit {
  Shutdown,
  Failed(SupervisorError),
}

impl Supervisor {
  pub fn new(inventory: Inventory, metrics: Arc<ResourceMetrics>, options: SupervisorOptions) -> Self {
    Self {
      plugin: Arc::new(DevicePlugin::new(inventory.clone())),
      inventory,
      metrics,
      options,
    }
  }

  /// Registers, serves, and re-registers after every failure. Returns once
  /// `shutdown` fires or the inventory closes before it ever became ready.
  pub async fn run(self, shutdown: Shutdown) {
    let ready = tokio::select! {
      ready = self.inventory.wait_ready() => ready,
      _ = shutdown.wait() => false,
    };
    if !ready {
      return;
    }

    loop {
      let error = match self.serve_once(&shutdown).await {
        Exit::Shutdown => return,
        Exit::Failed(error) => error,
      };

      event!(
        target: "generic-device-plugin",
        Level::WARN,
        backoff = ?self.options.restart_backoff,
        "device plugin failed, restarting: {:#}",
        color_eyre::Report::new(error));

      tokio::select! {
        _ = shutdown.wait() => return,
        _ = time::sleep(self.options.restart_backoff) => {}
      }

      self.metrics.inc_restarts();
    }
  }

  async fn serve_once(&self, shutdown: &Shutdown) -> Exit {
    let started = v1beta1::KubeletDevicePluginV1Beta1::from_arc(Arc::clone(&self.plugin))
      .start(self.inventory.resource(), &self.options.plugin_dir);
    let mut server = tokio::select! {
      _ = shutdown.wait() => return Exit::Shutdown,
      started = started => match started {
        Ok(server) => server,
        Err(error) => return Exit::Failed(error.into()),
      },
    };

    event!(
      target: "generic-device-plugin",
      Level::INFO,
      socket = %server.socket_path().display(),
      "device plugin registered");

    let mut socket_check = time::interval(self.options.socket_check_interval);
    socket_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
      tokio::select! {
        _ = shutdown.wait() => break Exit::Shutdown,
        result = &mut server => break Exit::Failed(SupervisorError::Exited(result.err())),
        _ = socket_check.tick() => {
          if !server.socket_path().exists() {
            break Exit::Failed(SupervisorError::SocketRemoved(server.socket_path().to_owned()));
          }
        }
      }
    };

    self.stop(server).await;
    exit
  }

  async fn stop(&self, server: KubernetesDevicePluginServer) {
    let socket_path = server.socket_path().to_owned();
    if let Err(error) = server.abort(self.options.abort_grace).await {
      event!(
        target: "generic-device-plugin",
        Level::DEBUG,
        %error,
        "device plugin server stopped with an error");
    }

    match tokio::fs::remove_file(&socket_path).await {
      Ok(()) => {}
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
      Err(error) => event!(
        target: "generic-device-plugin",
        Level::WARN,
        socket = %socket_path.display(),
        %error,
        "failed to remove device plugin socket"),
    }
  }
}

use super::supervisor::{Supervisor, SupervisorOptions};
use crate::{
  config::Config,
  discovery::Expander,
  inventory::{Inventory, REFRESH_INTERVAL},
  metrics::Metrics,
  utils::{shutdown_channel, AggregateErrorExt, ShutdownTrigger},
};
use color_eyre::Result;
use futures::future::join_all;
use std::{collections::BTreeMap, path::Path};
use tokio::task::JoinHandle;
use tracing::{event, span, Instrument, Level};

#[derive(Debug)]
struct PluginHandle {
  shutdown: ShutdownTrigger,
  refresh: JoinHandle<()>,
  supervisor: JoinHandle<()>,
}

impl PluginHandle {
  async fn stop(self) -> Vec<Result<(), tokio::task::JoinError>> {
    self.shutdown.trigger();
    vec![self.refresh.await, self.supervisor.await]
  }
}

/// Every running plugin, keyed by resource name.
#[derive(Debug, Default)]
pub struct PluginRegistry {
  plugins: BTreeMap<String, PluginHandle>,
}

impl PluginRegistry {
  /// Starts one refresh loop and one supervisor per configured device.
  pub fn start(config: &Config, host_root: &Path, plugin_dir: &Path, metrics: &Metrics) -> Self {
    let mut plugins = BTreeMap::new();
    for spec in config.devices() {
      let resource = config.resource_name(spec);
      let resource_metrics = metrics.resource(&resource);
      let inventory = Inventory::new(
        resource.clone(),
        spec.clone(),
        Expander::new(host_root),
        resource_metrics.clone(),
      );

      let span = span!(target: "generic-device-plugin", Level::INFO, "plugin", resource = %resource);
      let (shutdown, stopped) = shutdown_channel();
      let refresh = tokio::spawn(
        inventory
          .clone()
          .run(REFRESH_INTERVAL, stopped.clone())
          .instrument(span.clone()),
      );
      let supervisor = tokio::spawn(
        Supervisor::new(inventory, resource_metrics, SupervisorOptions::new(plugin_dir))
          .run(stopped)
          .instrument(span),
      );

      event!(target: "generic-device-plugin", Level::INFO, resource = %resource, "started plugin");
      plugins.insert(
        resource,
        PluginHandle {
          shutdown,
          refresh,
          supervisor,
        },
      );
    }

    Self { plugins }
  }

  pub fn len(&self) -> usize {
    self.plugins.len()
  }

  pub fn is_empty(&self) -> bool {
    self.plugins.is_empty()
  }

  /// Stops every plugin and waits for their tasks to finish.
  pub async fn stop(self) -> Result<()> {
    let results = join_all(self.plugins.into_values().map(PluginHandle::stop)).await;

    results.into_iter().flatten().collect_errors()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::parse_device;
  use std::{fs, time::Duration};

  #[tokio::test]
  async fn starts_one_plugin_per_device_and_stops_them() {
    let host = tempfile::tempdir().unwrap();
    fs::create_dir_all(host.path().join("dev")).unwrap();
    fs::write(host.path().join("dev/fuse"), b"").unwrap();
    let plugins = tempfile::tempdir().unwrap();

    let config = Config::default().with_overrides(
      None,
      vec![
        parse_device("name: fuse\ngroups:\n  - paths:\n      - path: /dev/fuse\n").unwrap(),
        parse_device("name: serial\ngroups:\n  - paths:\n      - path: /dev/ttyUSB*\n").unwrap(),
      ],
    );
    let metrics = Metrics::new();

    let registry = PluginRegistry::start(&config, host.path(), plugins.path(), &metrics);
    assert_eq!(registry.len(), 2);

    // the first refresh runs straight away
    for _ in 0..200 {
      if metrics.resource("squat.ai/fuse").devices() == 1 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(metrics.resource("squat.ai/fuse").devices(), 1);

    // no kubelet is listening, so supervisors sit in back-off until stopped
    tokio::time::timeout(Duration::from_secs(5), registry.stop())
      .await
      .unwrap()
      .unwrap();
  }
}

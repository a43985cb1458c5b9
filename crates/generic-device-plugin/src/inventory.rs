use crate::{
  allocation::{self, AllocationError},
  config::DeviceSpec,
  discovery::{DiscoveryError, Expander, Unit},
  metrics::ResourceMetrics,
  utils::Shutdown,
};
use arc_swap::ArcSwapOption;
use kubelet_deviceplugin_proto::v1beta1;
use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
  time::Duration,
};
use tokio::{
  sync::{watch, Mutex},
  time::{self, MissedTickBehavior},
};
use tracing::{event, Level};

/// How often discovery is re-run.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Published on every visible change of the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
  /// No refresh has completed yet.
  Pending,
  /// The n-th distinct unit set, counting from 1.
  Ready(u64),
  /// The inventory stopped refreshing.
  Closed,
}

/// An immutable view of every unit at one point in time.
#[derive(Debug, Default)]
pub struct Snapshot {
  units: Vec<Unit>,
  index: HashMap<String, usize>,
}

impl Snapshot {
  /// Builds a snapshot, keeping the first of any units sharing an id.
  pub fn new(units: impl IntoIterator<Item = Unit>) -> Self {
    let mut snapshot = Snapshot::default();
    for unit in units {
      if snapshot.index.contains_key(&unit.id) {
        event!(
          target: "generic-device-plugin",
          Level::DEBUG,
          id = %unit.id,
          "dropping duplicate unit");
        continue;
      }

      snapshot.index.insert(unit.id.clone(), snapshot.units.len());
      snapshot.units.push(unit);
    }

    snapshot
  }

  pub fn get(&self, id: &str) -> Option<&Unit> {
    self.index.get(id).map(|&position| &self.units[position])
  }

  pub fn units(&self) -> &[Unit] {
    &self.units
  }

  pub fn len(&self) -> usize {
    self.units.len()
  }

  pub fn is_empty(&self) -> bool {
    self.units.is_empty()
  }

  /// Whether kubelet would see a different device list. Only the id set is
  /// compared; units are always healthy today.
  fn differs_from(&self, other: &Snapshot) -> bool {
    let ours: HashSet<&str> = self.index.keys().map(String::as_str).collect();
    let theirs: HashSet<&str> = other.index.keys().map(String::as_str).collect();

    ours != theirs
  }

  pub fn to_response(&self) -> v1beta1::ListAndWatchResponse {
    v1beta1::ListAndWatchResponse {
      devices: self.units.iter().map(v1beta1::Device::from).collect(),
    }
  }
}

struct State {
  resource: String,
  spec: DeviceSpec,
  expander: Expander,
  snapshot: ArcSwapOption<Snapshot>,
  refreshing: Mutex<()>,
  revision: watch::Sender<Revision>,
  metrics: Arc<ResourceMetrics>,
}

/// The live set of units for one resource. Cheap to clone; every clone sees
/// the same snapshot.
#[derive(Clone)]
pub struct Inventory {
  state: Arc<State>,
}

impl Inventory {
  pub fn new(
    resource: impl Into<String>,
    spec: DeviceSpec,
    expander: Expander,
    metrics: Arc<ResourceMetrics>,
  ) -> Self {
    let (revision, _) = watch::channel(Revision::Pending);

    Self {
      state: Arc::new(State {
        resource: resource.into(),
        spec,
        expander,
        snapshot: ArcSwapOption::empty(),
        refreshing: Mutex::new(()),
        revision,
        metrics,
      }),
    }
  }

  pub fn resource(&self) -> &str {
    &self.state.resource
  }

  /// Re-runs discovery and swaps in the result. Returns whether the set of
  /// unit ids changed; the first refresh always counts as a change. On error
  /// the previous snapshot stays in place.
  pub async fn refresh(&self) -> Result<bool, DiscoveryError> {
    let _refreshing = self.state.refreshing.lock().await;

    let units = self.state.expander.expand(&self.state.spec).await?;
    let next = Arc::new(Snapshot::new(units));
    self.state.metrics.set_devices(next.len());

    let previous = self.state.snapshot.swap(Some(Arc::clone(&next)));
    let changed = previous.map_or(true, |previous| previous.differs_from(&next));
    if changed {
      self.state.revision.send_modify(|revision| {
        *revision = match *revision {
          Revision::Pending => Revision::Ready(1),
          Revision::Ready(n) => Revision::Ready(n + 1),
          Revision::Closed => Revision::Closed,
        }
      });
    }

    Ok(changed)
  }

  /// The current snapshot, `None` until the first refresh succeeded.
  pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
    self.state.snapshot.load_full()
  }

  #[cfg(test)]
  pub fn lookup(&self, id: &str) -> Option<Unit> {
    self.snapshot().and_then(|snapshot| snapshot.get(id).cloned())
  }

  #[cfg(test)]
  pub fn is_ready(&self) -> bool {
    self.snapshot().is_some()
  }

  pub fn subscribe(&self) -> watch::Receiver<Revision> {
    self.state.revision.subscribe()
  }

  /// Resolves with `true` once the inventory is ready, or `false` if it was
  /// closed first.
  pub async fn wait_ready(&self) -> bool {
    let mut revisions = self.subscribe();
    loop {
      let revision = *revisions.borrow_and_update();
      match revision {
        Revision::Ready(_) => return true,
        Revision::Closed => return false,
        Revision::Pending => {}
      }

      if revisions.changed().await.is_err() {
        return false;
      }
    }
  }

  /// Wakes every subscriber one last time; watchers end their streams.
  pub fn close(&self) {
    self.state.revision.send_replace(Revision::Closed);
  }

  /// Serves one allocate call against a single snapshot and counts the
  /// satisfied containers.
  pub fn allocate(
    &self,
    request: &v1beta1::AllocateRequest,
  ) -> Result<v1beta1::AllocateResponse, AllocationError> {
    let snapshot = self.snapshot().unwrap_or_default();
    let response = allocation::allocate(&snapshot, request)?;
    self
      .state
      .metrics
      .add_allocations(response.container_responses.len());

    Ok(response)
  }

  /// Refreshes every `interval` until `shutdown` fires, then closes the
  /// inventory. The first refresh runs immediately.
  pub async fn run(self, interval: Duration, shutdown: Shutdown) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = shutdown.wait() => break,
        _ = ticker.tick() => {}
      }

      match self.refresh().await {
        Ok(true) => match self.snapshot() {
          Some(snapshot) if snapshot.is_empty() => event!(
            target: "generic-device-plugin",
            Level::WARN,
            resource = %self.resource(),
            "no devices found"),
          snapshot => event!(
            target: "generic-device-plugin",
            Level::INFO,
            resource = %self.resource(),
            units = snapshot.map_or(0, |snapshot| snapshot.len()),
            "devices changed"),
        },
        Ok(false) => event!(target: "generic-device-plugin", Level::TRACE, "devices unchanged"),
        Err(error) => event!(
          target: "generic-device-plugin",
          Level::WARN,
          "failed to refresh devices: {:#}",
          color_eyre::Report::new(error)),
      }
    }

    self.close();
  }
}

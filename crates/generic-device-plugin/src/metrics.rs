//! Process wide counters, exposed in the Prometheus text format.
//!
//! Counters are keyed by resource name and outlive configuration reloads, so
//! a restarted plugin keeps counting where the previous one stopped.

use std::{
  collections::BTreeMap,
  fmt::Write,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
  },
};

const DEVICES: &str = "generic_device_plugin_devices";
const ALLOCATIONS: &str = "generic_device_plugin_allocations_total";
const RESTARTS: &str = "generic_device_plugin_restarts_total";

/// Counters for one advertised resource.
#[derive(Debug, Default)]
pub struct ResourceMetrics {
  devices: AtomicU64,
  allocations: AtomicU64,
  restarts: AtomicU64,
}

impl ResourceMetrics {
  pub fn set_devices(&self, count: usize) {
    self.devices.store(count as u64, Ordering::Relaxed);
  }

  pub fn add_allocations(&self, containers: usize) {
    self.allocations.fetch_add(containers as u64, Ordering::Relaxed);
  }

  pub fn inc_restarts(&self) {
    self.restarts.fetch_add(1, Ordering::Relaxed);
  }

  pub fn devices(&self) -> u64 {
    self.devices.load(Ordering::Relaxed)
  }

  pub fn allocations(&self) -> u64 {
    self.allocations.load(Ordering::Relaxed)
  }

  pub fn restarts(&self) -> u64 {
    self.restarts.load(Ordering::Relaxed)
  }
}

#[derive(Debug, Default)]
pub struct Metrics {
  resources: RwLock<BTreeMap<String, Arc<ResourceMetrics>>>,
}

impl Metrics {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Counters for `resource`, created on first use.
  pub fn resource(&self, resource: &str) -> Arc<ResourceMetrics> {
    {
      let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
      if let Some(metrics) = resources.get(resource) {
        return Arc::clone(metrics);
      }
    }

    let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(resources.entry(resource.to_owned()).or_default())
  }

  pub fn render(&self) -> String {
    let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
    let families: [(&str, &str, &str, fn(&ResourceMetrics) -> u64); 3] = [
      (
        DEVICES,
        "gauge",
        "The number of devices managed by this device plugin.",
        ResourceMetrics::devices,
      ),
      (
        ALLOCATIONS,
        "counter",
        "The total number of device allocations made by this device plugin.",
        ResourceMetrics::allocations,
      ),
      (
        RESTARTS,
        "counter",
        "The number of times the device plugin has restarted.",
        ResourceMetrics::restarts,
      ),
    ];

    let mut out = String::new();
    for (name, kind, help, value) in families {
      let _ = writeln!(out, "# HELP {} {}", name, help);
      let _ = writeln!(out, "# TYPE {} {}", name, kind);
      for (resource, metrics) in resources.iter() {
        let _ = writeln!(
          out,
          "{}{{resource=\"{}\"}} {}",
          name,
          escape_label(resource),
          value(metrics)
        );
      }
    }

    out
  }
}

fn escape_label(value: &str) -> String {
  value
    .replace('\\', "\\\\")
    .replace('"', "\\\"")
    .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resources_share_counters() {
    let metrics = Metrics::new();
    metrics.resource("squat.ai/serial").add_allocations(2);
    metrics.resource("squat.ai/serial").add_allocations(1);

    assert_eq!(metrics.resource("squat.ai/serial").allocations(), 3);
    assert_eq!(metrics.resource("squat.ai/fuse").allocations(), 0);
  }

  #[test]
  fn renders_prometheus_text() {
    let metrics = Metrics::new();
    let serial = metrics.resource("squat.ai/serial");
    serial.set_devices(4);
    serial.add_allocations(1);
    serial.inc_restarts();

    let text = metrics.render();
    assert!(text.contains("# TYPE generic_device_plugin_devices gauge\n"));
    assert!(text.contains("generic_device_plugin_devices{resource=\"squat.ai/serial\"} 4\n"));
    assert!(text.contains("generic_device_plugin_allocations_total{resource=\"squat.ai/serial\"} 1\n"));
    assert!(text.contains("generic_device_plugin_restarts_total{resource=\"squat.ai/serial\"} 1\n"));
  }

  #[test]
  fn label_values_are_escaped() {
    assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
  }
}

use super::{search, DiscoveryError, PathResolver, Unit, UsbScanner};
use crate::config::{DeviceSpec, GroupMembers, PathSpec, PathType, UsbSpec};
use kubelet_deviceplugin_proto::v1beta1;
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use tokio::task;
use tracing::{event, Level};

/// USB device nodes are always handed out read/write, never mknod.
const USB_PERMISSIONS: &str = "rw";

/// Collects the members of one unit and derives its id.
///
/// The id is the hex sha1 of the decimal repetition index followed by every
/// host path in member order. Changing that order changes every id.
struct UnitBuilder {
  digest: Sha1,
  device_specs: Vec<v1beta1::DeviceSpec>,
  mounts: Vec<v1beta1::Mount>,
}

impl UnitBuilder {
  fn new(repetition: u32) -> Self {
    let mut digest = Sha1::new();
    digest.update(repetition.to_string().as_bytes());

    Self {
      digest,
      device_specs: Vec::new(),
      mounts: Vec::new(),
    }
  }

  fn device(&mut self, host_path: &str, container_path: String, permissions: &str) {
    self.digest.update(host_path.as_bytes());
    self.device_specs.push(v1beta1::DeviceSpec {
      container_path,
      host_path: host_path.to_owned(),
      permissions: permissions.to_owned(),
    });
  }

  fn mount(&mut self, host_path: &str, container_path: String, read_only: bool) {
    self.digest.update(host_path.as_bytes());
    self.mounts.push(v1beta1::Mount {
      container_path,
      host_path: host_path.to_owned(),
      read_only,
    });
  }

  fn member(&mut self, spec: &PathSpec, host_path: &str) {
    let container_path = spec.container_path(host_path);
    match spec.kind {
      PathType::Device => self.device(host_path, container_path, &spec.permissions),
      PathType::Mount => self.mount(host_path, container_path, spec.read_only),
    }
  }

  fn finish(self) -> Unit {
    Unit {
      id: hex::encode(self.digest.finalize()),
      health: v1beta1::DeviceHealth::Healthy,
      device_specs: self.device_specs,
      mounts: self.mounts,
    }
  }
}

/// Number of units a path group forms: the smallest match count among its
/// required members. A group made only of optional members is sized by the
/// members that matched anything.
fn cardinality(specs: &[PathSpec], matches: &[Vec<String>]) -> usize {
  let all_optional = specs.iter().all(|spec| spec.optional);

  specs
    .iter()
    .zip(matches)
    .filter(|(spec, found)| !spec.optional || (all_optional && !found.is_empty()))
    .map(|(_, found)| found.len())
    .min()
    .unwrap_or(0)
}

fn expand_paths(
  resolver: &PathResolver,
  specs: &[PathSpec],
  count: u32,
) -> Result<Vec<Unit>, DiscoveryError> {
  let matches = specs
    .iter()
    .map(|spec| resolver.resolve(&spec.path))
    .collect::<Result<Vec<_>, _>>()?;

  let length = cardinality(specs, &matches);
  let mut units = Vec::with_capacity(length * count as usize);
  for index in 0..length {
    for repetition in 0..count {
      let mut unit = UnitBuilder::new(repetition);
      for (spec, found) in specs.iter().zip(&matches) {
        if let Some(host_path) = found.get(index) {
          unit.member(spec, host_path);
        }
      }

      units.push(unit.finish());
    }
  }

  Ok(units)
}

fn expand_usb(devices: &[super::UsbDevice], specs: &[UsbSpec], count: u32) -> Vec<Unit> {
  let mut host_paths: Vec<String> = specs
    .iter()
    .flat_map(|spec| search(devices, spec))
    .map(|device| device.host_path())
    .collect();
  host_paths.sort();
  host_paths.dedup();

  if host_paths.is_empty() {
    return Vec::new();
  }

  (0..count)
    .map(|repetition| {
      let mut unit = UnitBuilder::new(repetition);
      for host_path in &host_paths {
        unit.device(host_path, host_path.clone(), USB_PERMISSIONS);
      }

      unit.finish()
    })
    .collect()
}

/// Expands device specs against one host root.
#[derive(Debug, Clone)]
pub struct Expander {
  paths: PathResolver,
  usb: UsbScanner,
}

impl Expander {
  pub fn new(host_root: impl Into<PathBuf>) -> Self {
    let host_root = host_root.into();
    Self {
      usb: UsbScanner::new(&host_root),
      paths: PathResolver::new(host_root),
    }
  }

  /// Units currently available for `spec`, in group order. Globbing runs on
  /// the blocking pool so slow filesystems never stall the runtime.
  pub async fn expand(&self, spec: &DeviceSpec) -> Result<Vec<Unit>, DiscoveryError> {
    let mut units = Vec::new();
    for (group_index, group) in spec.groups.iter().enumerate() {
      let expanded = match &group.members {
        GroupMembers::Paths(paths) => {
          let resolver = self.paths.clone();
          let paths = paths.clone();
          let count = group.count;
          task::spawn_blocking(move || expand_paths(&resolver, &paths, count)).await??
        }
        GroupMembers::Usb(specs) => {
          let devices = self.usb.enumerate().await?;
          expand_usb(&devices, specs, group.count)
        }
      };

      event!(
        target: "generic-device-plugin",
        Level::DEBUG,
        device = %spec.name,
        group = group_index,
        units = expanded.len(),
        "expanded group");

      units.extend(expanded);
    }

    Ok(units)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::{Group, UsbId},
    discovery::usb::tests::yubikeys,
  };
  use std::{collections::HashSet, fs, path::Path};

  fn touch(root: &Path, paths: &[&str]) {
    for path in paths {
      let full = root.join(path.trim_start_matches('/'));
      fs::create_dir_all(full.parent().unwrap()).unwrap();
      fs::write(full, b"").unwrap();
    }
  }

  fn path(pattern: &str) -> PathSpec {
    PathSpec {
      path: pattern.into(),
      mount_path: String::new(),
      permissions: "mrw".into(),
      read_only: false,
      kind: PathType::Device,
      optional: false,
    }
  }

  fn optional(pattern: &str) -> PathSpec {
    PathSpec {
      optional: true,
      ..path(pattern)
    }
  }

  fn spec(groups: Vec<Group>) -> DeviceSpec {
    DeviceSpec {
      name: "test".into(),
      groups,
    }
  }

  fn paths_group(paths: Vec<PathSpec>, count: u32) -> Group {
    Group {
      members: GroupMembers::Paths(paths),
      count,
    }
  }

  fn host_paths(unit: &Unit) -> Vec<&str> {
    unit
      .device_specs
      .iter()
      .map(|spec| spec.host_path.as_str())
      .chain(unit.mounts.iter().map(|mount| mount.host_path.as_str()))
      .collect()
  }

  #[tokio::test]
  async fn serial_ports_become_one_unit_each() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2", "/dev/ttyUSB3"]);

    let expander = Expander::new(dir.path());
    let units = expander
      .expand(&spec(vec![paths_group(vec![path("/dev/ttyUSB*")], 1)]))
      .await
      .unwrap();

    assert_eq!(units.len(), 4);
    for (index, unit) in units.iter().enumerate() {
      let expected = format!("/dev/ttyUSB{}", index);
      assert_eq!(
        unit.device_specs,
        vec![v1beta1::DeviceSpec {
          container_path: expected.clone(),
          host_path: expected,
          permissions: "mrw".into(),
        }]
      );
      assert!(unit.mounts.is_empty());
      assert!(unit.is_healthy());
    }
  }

  #[tokio::test]
  async fn ids_are_sha1_of_repetition_then_paths() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["/dev/fuse"]);

    let units = Expander::new(dir.path())
      .expand(&spec(vec![paths_group(vec![path("/dev/fuse")], 1)]))
      .await
      .unwrap();

    let mut digest = Sha1::new();
    digest.update(b"0");
    digest.update(b"/dev/fuse");
    assert_eq!(units[0].id, hex::encode(digest.finalize()));
    assert_eq!(units[0].id.len(), 40);
  }

  #[tokio::test]
  async fn count_repeats_with_distinct_ids() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["/dev/fuse", "/dev/net/tun"]);

    let units = Expander::new(dir.path())
      .expand(&spec(vec![paths_group(
        vec![path("/dev/fuse"), path("/dev/net/tun")],
        10,
      )]))
      .await
      .unwrap();

    assert_eq!(units.len(), 10);
    let ids: HashSet<_> = units.iter().map(|unit| unit.id.clone()).collect();
    assert_eq!(ids.len(), 10);
    for unit in &units {
      assert_eq!(host_paths(unit), vec!["/dev/fuse", "/dev/net/tun"]);
    }
  }

  #[tokio::test]
  async fn cardinality_is_capped_by_the_smallest_match() {
    let dir = tempfile::tempdir().unwrap();
    touch(
      dir.path(),
      &["/dev/a0", "/dev/a1", "/dev/a2", "/dev/a3", "/dev/b0", "/dev/b1"],
    );

    let units = Expander::new(dir.path())
      .expand(&spec(vec![paths_group(vec![path("/dev/a*"), path("/dev/b*")], 1)]))
      .await
      .unwrap();

    assert_eq!(units.len(), 2);
    assert_eq!(host_paths(&units[0]), vec!["/dev/a0", "/dev/b0"]);
    assert_eq!(host_paths(&units[1]), vec!["/dev/a1", "/dev/b1"]);
  }

  #[tokio::test]
  async fn missing_required_path_voids_the_group() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["/dev/ttyUSB0"]);

    let units = Expander::new(dir.path())
      .expand(&spec(vec![paths_group(
        vec![path("/dev/ttyUSB0"), path("/dev/ttyUSB1")],
        1,
      )]))
      .await
      .unwrap();

    assert!(units.is_empty());
  }

  #[tokio::test]
  async fn optional_paths() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["/dev/a", "/dev/c"]);
    let expander = Expander::new(dir.path());

    let some = expander
      .expand(&spec(vec![paths_group(
        vec![optional("/dev/a"), optional("/dev/b"), optional("/dev/c")],
        1,
      )]))
      .await
      .unwrap();
    assert_eq!(some.len(), 1);
    assert_eq!(host_paths(&some[0]), vec!["/dev/a", "/dev/c"]);

    let none = expander
      .expand(&spec(vec![paths_group(
        vec![optional("/dev/x"), optional("/dev/y")],
        1,
      )]))
      .await
      .unwrap();
    assert!(none.is_empty());

    let mixed = expander
      .expand(&spec(vec![paths_group(vec![path("/dev/a"), optional("/dev/b")], 1)]))
      .await
      .unwrap();
    assert_eq!(mixed.len(), 1);
    assert_eq!(host_paths(&mixed[0]), vec!["/dev/a"]);
  }

  #[tokio::test]
  async fn all_optional_present_gives_every_member() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["/dev/a", "/dev/b", "/dev/c"]);

    let units = Expander::new(dir.path())
      .expand(&spec(vec![paths_group(
        vec![optional("/dev/a"), optional("/dev/b"), optional("/dev/c")],
        1,
      )]))
      .await
      .unwrap();

    assert_eq!(units.len(), 1);
    assert_eq!(units[0].device_specs.len(), 3);
  }

  #[tokio::test]
  async fn mount_directory_and_mount_type() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["/dev/ttyUSB0", "/dev/ttyUSB1", "/etc/ssl/certs/ca.pem"]);

    let serial = PathSpec {
      mount_path: "/dev/serial/".into(),
      ..path("/dev/ttyUSB*")
    };
    let certs = PathSpec {
      kind: PathType::Mount,
      read_only: true,
      ..path("/etc/ssl/certs")
    };

    let expander = Expander::new(dir.path());
    let units = expander
      .expand(&spec(vec![paths_group(vec![serial], 1)]))
      .await
      .unwrap();
    let containers: Vec<_> = units
      .iter()
      .map(|unit| unit.device_specs[0].container_path.as_str())
      .collect();
    assert_eq!(containers, vec!["/dev/serial/ttyUSB0", "/dev/serial/ttyUSB1"]);

    let units = expander
      .expand(&spec(vec![paths_group(vec![certs], 1)]))
      .await
      .unwrap();
    assert_eq!(units.len(), 1);
    assert!(units[0].device_specs.is_empty());
    assert_eq!(
      units[0].mounts,
      vec![v1beta1::Mount {
        container_path: "/etc/ssl/certs".into(),
        host_path: "/etc/ssl/certs".into(),
        read_only: true,
      }]
    );
  }

  #[tokio::test]
  async fn expansion_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["/dev/video0", "/dev/video1"]);
    let expander = Expander::new(dir.path());
    let device = spec(vec![paths_group(vec![path("/dev/video*")], 2)]);

    let first: Vec<_> = expander.expand(&device).await.unwrap();
    let second: Vec<_> = expander.expand(&device).await.unwrap();
    assert_eq!(first, second);
  }

  #[tokio::test]
  async fn empty_group_contributes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let units = Expander::new(dir.path())
      .expand(&spec(vec![paths_group(Vec::new(), 3)]))
      .await
      .unwrap();

    assert!(units.is_empty());
  }

  #[tokio::test]
  async fn usb_group_attaches_every_match_to_each_repetition() {
    let dir = tempfile::tempdir().unwrap();
    yubikeys(dir.path());

    let group = Group {
      members: GroupMembers::Usb(vec![UsbSpec {
        vendor: UsbId(0x1050),
        product: UsbId(0x0407),
        serial: None,
      }]),
      count: 2,
    };
    let units = Expander::new(dir.path())
      .expand(&spec(vec![group]))
      .await
      .unwrap();

    assert_eq!(units.len(), 2);
    assert_ne!(units[0].id, units[1].id);
    for unit in &units {
      assert_eq!(
        unit.device_specs,
        vec![
          v1beta1::DeviceSpec {
            container_path: "/dev/bus/usb/003/022".into(),
            host_path: "/dev/bus/usb/003/022".into(),
            permissions: "rw".into(),
          },
          v1beta1::DeviceSpec {
            container_path: "/dev/bus/usb/004/025".into(),
            host_path: "/dev/bus/usb/004/025".into(),
            permissions: "rw".into(),
          },
        ]
      );
    }
  }

  #[tokio::test]
  async fn usb_group_without_matches_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    yubikeys(dir.path());

    let group = Group {
      members: GroupMembers::Usb(vec![UsbSpec {
        vendor: UsbId(0x1050),
        product: UsbId(0x0407),
        serial: Some("99".into()),
      }]),
      count: 1,
    };
    let units = Expander::new(dir.path())
      .expand(&spec(vec![group]))
      .await
      .unwrap();

    assert!(units.is_empty());
  }
}

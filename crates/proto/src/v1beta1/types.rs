use super::proto;
use std::{collections::HashMap, fmt};

/// Field level conversion between the plugin facing types and the prost
/// generated messages.
trait Convert<T> {
  fn convert(self) -> T;
}

macro_rules! identity {
  ($($ty:ty),+ $(,)?) => {
    $(
      impl Convert<$ty> for $ty {
        #[inline]
        fn convert(self) -> $ty {
          self
        }
      }
    )+
  };
}

identity!(bool, i32, i64, String, HashMap<String, String>);

impl<A: Convert<B>, B> Convert<Vec<B>> for Vec<A> {
  fn convert(self) -> Vec<B> {
    self.into_iter().map(Convert::convert).collect()
  }
}

impl<A: Convert<B>, B> Convert<Option<B>> for Option<A> {
  fn convert(self) -> Option<B> {
    self.map(Convert::convert)
  }
}

/// Wires a type to its prost counterpart. Each field is listed as
/// `ours <=> wire` since prost mangles some of the upstream field names.
macro_rules! mirror {
  ($name:ident { $($field:ident <=> $wire:ident),+ $(,)? }) => {
    impl From<proto::$name> for $name {
      fn from(value: proto::$name) -> Self {
        Self { $($field: Convert::convert(value.$wire)),+ }
      }
    }

    impl From<$name> for proto::$name {
      fn from(value: $name) -> Self {
        Self { $($wire: Convert::convert(value.$field)),+ }
      }
    }

    impl Convert<$name> for proto::$name {
      #[inline]
      fn convert(self) -> $name {
        self.into()
      }
    }

    impl Convert<proto::$name> for $name {
      #[inline]
      fn convert(self) -> proto::$name {
        self.into()
      }
    }
  };
}

/// One ListAndWatch update: the complete device list as of now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListAndWatchResponse {
  pub devices: Vec<Device>,
}
mirror!(ListAndWatchResponse { devices <=> devices });

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyInfo {
  pub nodes: Vec<NumaNode>,
}
mirror!(TopologyInfo { nodes <=> nodes });

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaNode {
  pub id: i64,
}
mirror!(NumaNode { id <=> id });

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
  /// Opaque id, at most 63 characters.
  pub id: String,
  pub health: DeviceHealth,
  pub topology: Option<TopologyInfo>,
}
mirror!(Device {
  id <=> id,
  health <=> health,
  topology <=> topology,
});

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceHealth {
  Healthy,
  Unhealthy,
  Other(String),
}

impl DeviceHealth {
  pub fn as_str(&self) -> &str {
    match self {
      DeviceHealth::Healthy => super::HEALTHY,
      DeviceHealth::Unhealthy => super::UNHEALTHY,
      DeviceHealth::Other(v) => v,
    }
  }

  pub fn is_healthy(&self) -> bool {
    matches!(self, DeviceHealth::Healthy)
  }
}

impl Default for DeviceHealth {
  fn default() -> Self {
    DeviceHealth::Healthy
  }
}

impl fmt::Display for DeviceHealth {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl Convert<DeviceHealth> for String {
  fn convert(self) -> DeviceHealth {
    match &*self {
      super::HEALTHY => DeviceHealth::Healthy,
      super::UNHEALTHY => DeviceHealth::Unhealthy,
      _ => DeviceHealth::Other(self),
    }
  }
}

impl Convert<String> for DeviceHealth {
  fn convert(self) -> String {
    match self {
      DeviceHealth::Other(v) => v,
      known => known.as_str().to_owned(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreStartContainerRequest {
  pub device_ids: Vec<String>,
}
mirror!(PreStartContainerRequest {
  device_ids <=> devices_i_ds,
});

/// Sent at pod admission time. The plugin may pick `allocation_size` ids out
/// of `available_device_ids`, keeping every id in `must_include_device_ids`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferredAllocationRequest {
  pub container_requests: Vec<ContainerPreferredAllocationRequest>,
}
mirror!(PreferredAllocationRequest {
  container_requests <=> container_requests,
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerPreferredAllocationRequest {
  pub available_device_ids: Vec<String>,
  pub must_include_device_ids: Vec<String>,
  pub allocation_size: i32,
}
mirror!(ContainerPreferredAllocationRequest {
  available_device_ids <=> available_device_i_ds,
  must_include_device_ids <=> must_include_device_i_ds,
  allocation_size <=> allocation_size,
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferredAllocationResponse {
  pub container_responses: Vec<ContainerPreferredAllocationResponse>,
}
mirror!(PreferredAllocationResponse {
  container_responses <=> container_responses,
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerPreferredAllocationResponse {
  pub device_ids: Vec<String>,
}
mirror!(ContainerPreferredAllocationResponse {
  device_ids <=> device_i_ds,
});

/// Sent during container creation, one entry per container of the pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocateRequest {
  pub container_requests: Vec<ContainerAllocateRequest>,
}
mirror!(AllocateRequest {
  container_requests <=> container_requests,
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerAllocateRequest {
  pub device_ids: Vec<String>,
}
mirror!(ContainerAllocateRequest {
  device_ids <=> devices_i_ds,
});

/// Responses are positional: the n-th container response answers the n-th
/// container request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocateResponse {
  pub container_responses: Vec<ContainerAllocateResponse>,
}
mirror!(AllocateResponse {
  container_responses <=> container_responses,
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerAllocateResponse {
  pub envs: HashMap<String, String>,
  pub mounts: Vec<Mount>,
  pub devices: Vec<DeviceSpec>,
  pub annotations: HashMap<String, String>,
}
mirror!(ContainerAllocateResponse {
  envs <=> envs,
  mounts <=> mounts,
  devices <=> devices,
  annotations <=> annotations,
});

/// A host path bind mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mount {
  pub container_path: String,
  pub host_path: String,
  pub read_only: bool,
}
mirror!(Mount {
  container_path <=> container_path,
  host_path <=> host_path,
  read_only <=> read_only,
});

/// A host device node exposed to the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceSpec {
  pub container_path: String,
  pub host_path: String,
  /// Any combination of `r`, `w` and `m` (mknod).
  pub permissions: String,
}
mirror!(DeviceSpec {
  container_path <=> container_path,
  host_path <=> host_path,
  permissions <=> permissions,
});

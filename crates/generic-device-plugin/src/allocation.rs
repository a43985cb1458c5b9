use crate::inventory::Snapshot;
use kubelet_deviceplugin_proto::{tonic::Status, v1beta1};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
  #[error("unknown device {0:?}")]
  UnknownUnit(String),

  #[error("device {0:?} is not healthy")]
  UnhealthyUnit(String),
}

impl From<AllocationError> for Status {
  fn from(error: AllocationError) -> Self {
    match &error {
      AllocationError::UnknownUnit(_) => Status::not_found(error.to_string()),
      AllocationError::UnhealthyUnit(_) => Status::failed_precondition(error.to_string()),
    }
  }
}

fn allocate_container(
  snapshot: &Snapshot,
  request: &v1beta1::ContainerAllocateRequest,
) -> Result<v1beta1::ContainerAllocateResponse, AllocationError> {
  let mut response = v1beta1::ContainerAllocateResponse::default();
  for id in &request.device_ids {
    let unit = snapshot
      .get(id)
      .ok_or_else(|| AllocationError::UnknownUnit(id.clone()))?;
    if !unit.is_healthy() {
      return Err(AllocationError::UnhealthyUnit(id.clone()));
    }

    response.devices.extend(unit.device_specs.iter().cloned());
    response.mounts.extend(unit.mounts.iter().cloned());
  }

  Ok(response)
}

/// Builds one container response per container request, in request order.
/// Fails as a whole if any requested id is unknown or unhealthy.
pub fn allocate(
  snapshot: &Snapshot,
  request: &v1beta1::AllocateRequest,
) -> Result<v1beta1::AllocateResponse, AllocationError> {
  let container_responses = request
    .container_requests
    .iter()
    .map(|container| allocate_container(snapshot, container))
    .collect::<Result<Vec<_>, _>>()?;

  Ok(v1beta1::AllocateResponse {
    container_responses,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::discovery::Unit;
  use kubelet_deviceplugin_proto::tonic::Code;

  fn unit(id: &str, host_path: &str, health: v1beta1::DeviceHealth) -> Unit {
    Unit {
      id: id.into(),
      health,
      device_specs: vec![v1beta1::DeviceSpec {
        container_path: host_path.into(),
        host_path: host_path.into(),
        permissions: "mrw".into(),
      }],
      mounts: Vec::new(),
    }
  }

  fn snapshot() -> Snapshot {
    let mut fuse = unit("fuse", "/dev/fuse", v1beta1::DeviceHealth::Healthy);
    fuse.mounts.push(v1beta1::Mount {
      container_path: "/run/fuse".into(),
      host_path: "/run/fuse".into(),
      read_only: true,
    });

    Snapshot::new(vec![
      unit("a", "/dev/ttyUSB0", v1beta1::DeviceHealth::Healthy),
      unit("b", "/dev/ttyUSB1", v1beta1::DeviceHealth::Healthy),
      unit("sick", "/dev/ttyUSB2", v1beta1::DeviceHealth::Unhealthy),
      fuse,
    ])
  }

  fn request(containers: &[&[&str]]) -> v1beta1::AllocateRequest {
    v1beta1::AllocateRequest {
      container_requests: containers
        .iter()
        .map(|ids| v1beta1::ContainerAllocateRequest {
          device_ids: ids.iter().map(|id| id.to_string()).collect(),
        })
        .collect(),
    }
  }

  #[test]
  fn concatenates_units_in_request_order() {
    let response = allocate(&snapshot(), &request(&[&["b", "fuse"], &["a"]])).unwrap();
    assert_eq!(response.container_responses.len(), 2);

    let first = &response.container_responses[0];
    let host_paths: Vec<_> = first.devices.iter().map(|d| d.host_path.as_str()).collect();
    assert_eq!(host_paths, ["/dev/ttyUSB1", "/dev/fuse"]);
    assert_eq!(first.mounts.len(), 1);
    assert!(first.envs.is_empty() && first.annotations.is_empty());

    assert_eq!(response.container_responses[1].devices[0].host_path, "/dev/ttyUSB0");
  }

  #[test]
  fn duplicate_ids_are_honored() {
    let response = allocate(&snapshot(), &request(&[&["a", "a"]])).unwrap();
    assert_eq!(response.container_responses[0].devices.len(), 2);
  }

  #[test]
  fn empty_requests() {
    assert!(allocate(&snapshot(), &request(&[]))
      .unwrap()
      .container_responses
      .is_empty());

    let response = allocate(&snapshot(), &request(&[&[]])).unwrap();
    assert_eq!(response.container_responses, vec![Default::default()]);
  }

  #[test]
  fn unknown_id_fails_the_whole_request() {
    let error = allocate(&snapshot(), &request(&[&["a"], &["a", "gone"]])).unwrap_err();
    assert_eq!(error, AllocationError::UnknownUnit("gone".into()));
    assert_eq!(Status::from(error).code(), Code::NotFound);
  }

  #[test]
  fn unhealthy_id_is_refused() {
    let error = allocate(&snapshot(), &request(&[&["sick"]])).unwrap_err();
    assert_eq!(error, AllocationError::UnhealthyUnit("sick".into()));
    assert_eq!(Status::from(error).code(), Code::FailedPrecondition);
  }
}

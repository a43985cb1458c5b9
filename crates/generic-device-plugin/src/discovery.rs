//! Turns device specs into allocatable units by looking at the host.

mod expand;
mod path;
mod usb;

use kubelet_deviceplugin_proto::v1beta1;
use std::{io, path::PathBuf};
use thiserror::Error;
use tokio::task::JoinError;

pub use expand::Expander;
pub use path::PathResolver;
pub use usb::{search, UsbDevice, UsbScanner};

/// One allocatable instance of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
  pub id: String,
  pub health: v1beta1::DeviceHealth,
  pub device_specs: Vec<v1beta1::DeviceSpec>,
  pub mounts: Vec<v1beta1::Mount>,
}

impl Unit {
  pub fn is_healthy(&self) -> bool {
    self.health.is_healthy()
  }
}

impl From<&Unit> for v1beta1::Device {
  fn from(unit: &Unit) -> Self {
    v1beta1::Device {
      id: unit.id.clone(),
      health: unit.health.clone(),
      topology: None,
    }
  }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
  #[error("invalid glob pattern {pattern:?}")]
  Glob {
    pattern: String,
    #[source]
    source: glob::PatternError,
  },

  #[error("failed to read {path:?}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("USB discovery is unavailable, {path:?} is not a directory")]
  UsbUnavailable { path: PathBuf },

  #[error("discovery task failed")]
  Join(#[from] JoinError),
}

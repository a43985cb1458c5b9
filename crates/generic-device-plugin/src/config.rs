mod device_spec;
mod parse;
mod watch;

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::{
  collections::HashSet,
  fmt,
  path::{Path, PathBuf},
  sync::Arc,
};

pub use device_spec::{
  DeviceSpec, Group, GroupMembers, PathSpec, PathType, UsbId, UsbSpec,
};
pub use parse::{parse_device, ConfigError, ConfigFormat};
pub use watch::ConfigWatcherError;

/// Domain resources are advertised under unless configured otherwise.
pub const DEFAULT_DOMAIN: &str = "squat.ai";

/// Files tried, in order, when no config file is given.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["/etc/generic-device-plugin/config.yaml", "config.yaml"];

mod inner {
  use super::*;

  #[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
  #[serde(rename_all = "camelCase")]
  pub(super) struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) domain: Option<String>,

    #[serde(default)]
    pub(super) devices: Vec<DeviceSpec>,
  }
}

#[derive(Clone, PartialEq, Default)]
pub struct Config {
  inner: Arc<inner::Config>,
}

impl Config {
  pub fn domain(&self) -> &str {
    self.inner.domain.as_deref().unwrap_or(DEFAULT_DOMAIN)
  }

  pub fn devices(&self) -> &[DeviceSpec] {
    &self.inner.devices
  }

  /// `<domain>/<name>`, the resource name kubelet schedules against.
  pub fn resource_name(&self, device: &DeviceSpec) -> String {
    format!("{}/{}", self.domain(), device.name)
  }

  /// Applies command line settings on top of the file. A domain given on the
  /// command line wins; devices given on the command line replace the file's.
  pub fn with_overrides(&self, domain: Option<String>, devices: Vec<DeviceSpec>) -> Config {
    let mut inner = (*self.inner).clone();
    if domain.is_some() {
      inner.domain = domain;
    }

    if !devices.is_empty() {
      inner.devices = devices;
    }

    inner.into()
  }

  /// Checks everything that must hold before any plugin starts serving.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if !is_dns1123_subdomain(self.domain()) {
      return Err(ConfigError::InvalidDomain(self.domain().to_owned()));
    }

    if self.devices().is_empty() {
      return Err(ConfigError::NoDevices);
    }

    let mut resources = HashSet::new();
    for device in self.devices() {
      if !is_valid_name(&device.name) {
        return Err(ConfigError::InvalidName(device.name.clone()));
      }

      if device.groups.is_empty() {
        return Err(ConfigError::NoGroups(device.name.clone()));
      }

      for group in &device.groups {
        if let GroupMembers::Paths(paths) = &group.members {
          for path in paths {
            glob::Pattern::new(&path.path).map_err(|source| ConfigError::InvalidGlob {
              pattern: path.path.clone(),
              source,
            })?;
          }
        }
      }

      let resource = self.resource_name(device);
      if !resources.insert(resource.clone()) {
        return Err(ConfigError::DuplicateResource(resource));
      }
    }

    Ok(())
  }
}

/// `^[a-z0-9][-a-z0-9]*[a-z0-9]$`
fn is_valid_name(name: &str) -> bool {
  let bytes = name.as_bytes();
  let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

  match bytes {
    [first, middle @ .., last] => {
      alnum(first) && alnum(last) && middle.iter().all(|b| alnum(b) || *b == b'-')
    }
    _ => false,
  }
}

fn is_dns1123_label(label: &str) -> bool {
  let bytes = label.as_bytes();
  let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

  match bytes {
    [] => false,
    [only] => alnum(only),
    [first, middle @ .., last] => {
      bytes.len() <= 63
        && alnum(first)
        && alnum(last)
        && middle.iter().all(|b| alnum(b) || *b == b'-')
    }
  }
}

fn is_dns1123_subdomain(domain: &str) -> bool {
  domain.len() <= 253 && domain.split('.').all(is_dns1123_label)
}

impl From<inner::Config> for Config {
  fn from(inner: inner::Config) -> Self {
    Self {
      inner: Arc::new(inner),
    }
  }
}

impl fmt::Debug for Config {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.inner, f)
  }
}

impl Serialize for Config {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    Serialize::serialize(&*self.inner, serializer)
  }
}

impl<'de> Deserialize<'de> for Config {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    <inner::Config as Deserialize>::deserialize(deserializer).map(Self::from)
  }
}

impl Config {
  pub async fn read(file: impl AsRef<Path>, format: ConfigFormat) -> Result<Config, ConfigError> {
    parse::read_config(file, format).await
  }

  /// The first of [`DEFAULT_CONFIG_FILES`] that exists.
  pub fn find_default_file() -> Option<PathBuf> {
    DEFAULT_CONFIG_FILES
      .iter()
      .map(PathBuf::from)
      .find(|path| path.is_file())
  }

  pub fn watch(
    file: impl AsRef<Path>,
    format: ConfigFormat,
  ) -> Result<impl Stream<Item = Result<Config, ConfigError>>, ConfigWatcherError> {
    watch::watch(file, format)
  }
}

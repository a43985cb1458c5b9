use super::DiscoveryError;
use crate::config::{UsbId, UsbSpec};
use std::{
  io,
  path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{fs, task::JoinSet};
use tracing::{event, Level};

/// sysfs directory listing every USB device, relative to the host root.
pub const USB_DEVICES_DIR: &str = "sys/bus/usb/devices";

/// Where the raw USB device nodes live on the host.
pub const USB_DEV_DIR: &str = "/dev/bus/usb";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
  pub vendor: UsbId,
  pub product: UsbId,
  pub bus: u16,
  pub bus_device: u16,
  pub serial: Option<String>,
}

impl UsbDevice {
  /// `/dev/bus/usb/BBB/DDD` device node for this device.
  pub fn host_path(&self) -> String {
    format!("{}/{:03}/{:03}", USB_DEV_DIR, self.bus, self.bus_device)
  }

  fn matches(&self, spec: &UsbSpec) -> bool {
    self.vendor == spec.vendor
      && self.product == spec.product
      && spec
        .serial
        .as_ref()
        .map_or(true, |serial| self.serial.as_ref() == Some(serial))
  }
}

#[derive(Debug, Error)]
enum UsbAttributeError {
  #[error("cannot read attribute {attribute}")]
  Missing {
    attribute: &'static str,
    #[source]
    source: io::Error,
  },

  #[error("malformed attribute {attribute}: {value:?}")]
  Malformed {
    attribute: &'static str,
    value: String,
  },
}

async fn read_attribute(dir: &Path, attribute: &'static str) -> Result<String, UsbAttributeError> {
  let content = fs::read_to_string(dir.join(attribute))
    .await
    .map_err(|source| UsbAttributeError::Missing { attribute, source })?;

  Ok(content.trim_end().to_owned())
}

async fn read_parsed<T>(
  dir: &Path,
  attribute: &'static str,
  parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T, UsbAttributeError> {
  let value = read_attribute(dir, attribute).await?;
  match parse(&value) {
    Some(parsed) => Ok(parsed),
    None => Err(UsbAttributeError::Malformed { attribute, value }),
  }
}

async fn read_device(dir: &Path) -> Result<UsbDevice, UsbAttributeError> {
  let vendor = read_parsed(dir, "idVendor", UsbId::parse).await?;
  let product = read_parsed(dir, "idProduct", UsbId::parse).await?;
  let bus: u16 = read_parsed(dir, "busnum", |v| v.parse().ok()).await?;
  let bus_device: u16 = read_parsed(dir, "devnum", |v| v.parse().ok()).await?;
  let serial = read_attribute(dir, "serial").await.ok();

  Ok(UsbDevice {
    vendor,
    product,
    bus,
    bus_device,
    serial,
  })
}

/// Reads USB devices out of the sysfs tree below a host root.
#[derive(Debug, Clone)]
pub struct UsbScanner {
  devices_dir: PathBuf,
}

impl UsbScanner {
  pub fn new(host_root: impl AsRef<Path>) -> Self {
    Self {
      devices_dir: host_root.as_ref().join(USB_DEVICES_DIR),
    }
  }

  /// Fails when this host cannot be scanned for USB devices at all.
  pub fn ensure_available(&self) -> Result<(), DiscoveryError> {
    if cfg!(target_os = "linux") && self.devices_dir.is_dir() {
      Ok(())
    } else {
      Err(DiscoveryError::UsbUnavailable {
        path: self.devices_dir.clone(),
      })
    }
  }

  /// Lists every device exposing the attributes needed to address it. Entries
  /// are read concurrently and returned in no particular order; entries that
  /// cannot be read (interfaces, hubs without ids, half removed devices) are
  /// skipped.
  pub async fn enumerate(&self) -> Result<Vec<UsbDevice>, DiscoveryError> {
    let io_error = |source| DiscoveryError::Io {
      path: self.devices_dir.clone(),
      source,
    };

    let mut entries = fs::read_dir(&self.devices_dir).await.map_err(io_error)?;
    let mut scans = JoinSet::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
      let path = entry.path();
      scans.spawn(async move {
        let device = read_device(&path).await;
        (path, device)
      });
    }

    let mut devices = Vec::with_capacity(scans.len());
    while let Some(scan) = scans.join_next().await {
      match scan? {
        (_, Ok(device)) => devices.push(device),
        (path, Err(error)) => event!(
          target: "generic-device-plugin",
          Level::TRACE,
          path = %path.display(),
          %error,
          "skipping usb entry"),
      }
    }

    Ok(devices)
  }
}

/// Every device matching `spec`.
pub fn search<'a>(devices: &'a [UsbDevice], spec: &'a UsbSpec) -> impl Iterator<Item = &'a UsbDevice> + 'a {
  devices.iter().filter(move |device| device.matches(spec))
}

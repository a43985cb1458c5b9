use serde::{
  de::{self, Unexpected, Visitor},
  Deserialize, Deserializer, Serialize, Serializer,
};
use std::{convert::TryFrom, fmt, path::Path};
use thiserror::Error;

const DEFAULT_PERMISSIONS: &str = "mrw";

/// One named resource type, advertised as `<domain>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
  pub name: String,

  #[serde(default)]
  pub groups: Vec<Group>,
}

impl DeviceSpec {
  /// Whether any group needs the USB bus to be discovered.
  pub fn uses_usb(&self) -> bool {
    self
      .groups
      .iter()
      .any(|group| matches!(group.members, GroupMembers::Usb(_)))
  }
}

/// A set of members that is always allocated together, repeated `count`
/// times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGroup", into = "RawGroup")]
pub struct Group {
  pub members: GroupMembers,
  pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupMembers {
  Paths(Vec<PathSpec>),
  Usb(Vec<UsbSpec>),
}

#[derive(Debug, Error)]
pub enum GroupError {
  #[error("a group may list either paths or usb devices, not both")]
  MixedMembers,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGroup {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  paths: Vec<PathSpec>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  usb: Vec<UsbSpec>,

  #[serde(default)]
  count: u32,
}

impl TryFrom<RawGroup> for Group {
  type Error = GroupError;

  fn try_from(raw: RawGroup) -> Result<Self, Self::Error> {
    let members = match (raw.paths.is_empty(), raw.usb.is_empty()) {
      (false, false) => return Err(GroupError::MixedMembers),
      (_, true) => GroupMembers::Paths(raw.paths),
      (true, false) => GroupMembers::Usb(raw.usb),
    };

    Ok(Group {
      members,
      count: raw.count.max(1),
    })
  }
}

impl From<Group> for RawGroup {
  fn from(group: Group) -> Self {
    let (paths, usb) = match group.members {
      GroupMembers::Paths(paths) => (paths, Vec::new()),
      GroupMembers::Usb(usb) => (Vec::new(), usb),
    };

    RawGroup {
      paths,
      usb,
      count: group.count,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
  /// Exposed to the container as a device node.
  Device,
  /// Bind mounted into the container.
  Mount,
}

impl Default for PathType {
  #[inline]
  fn default() -> Self {
    PathType::Device
  }
}

fn default_permissions() -> String {
  DEFAULT_PERMISSIONS.into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSpec {
  /// Glob pattern, resolved against the host root.
  pub path: String,

  /// Container side path. Empty means the host path; a trailing `/` makes it
  /// a directory the matched file name is appended to.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub mount_path: String,

  #[serde(default = "default_permissions")]
  pub permissions: String,

  #[serde(default)]
  pub read_only: bool,

  #[serde(default, rename = "type")]
  pub kind: PathType,

  #[serde(default)]
  pub optional: bool,
}

impl PathSpec {
  /// Where a matched host path shows up inside the container.
  pub fn container_path(&self, host_path: &str) -> String {
    if self.mount_path.is_empty() {
      return host_path.to_owned();
    }

    if self.mount_path.ends_with('/') {
      if let Some(name) = Path::new(host_path).file_name() {
        return format!("{}{}", self.mount_path, name.to_string_lossy());
      }
    }

    self.mount_path.clone()
  }
}

/// A 16 bit USB vendor or product id. Always written as hex; a bare number in
/// a config file is read as the same hex digits, so `1050` means `0x1050`.
///
/// Ids are requested as strings so YAML hands over the scalar as written
/// instead of resolving `0x1050` or `1050` into an integer first. Formats
/// that only offer typed integers (TOML) still land in `visit_u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbId(pub u16);

impl UsbId {
  pub fn parse(value: &str) -> Option<Self> {
    let digits = value.trim();
    let digits = digits
      .strip_prefix("0x")
      .or_else(|| digits.strip_prefix("0X"))
      .unwrap_or(digits);

    if digits.is_empty() {
      return None;
    }

    u16::from_str_radix(digits, 16).ok().map(UsbId)
  }
}

impl fmt::Display for UsbId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:04x}", self.0)
  }
}

impl Serialize for UsbId {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.collect_str(self)
  }
}

struct UsbIdVisitor;
impl<'de> Visitor<'de> for UsbIdVisitor {
  type Value = UsbId;

  fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str("a hexadecimal USB id between 0 and ffff")
  }

  fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
  where
    E: de::Error,
  {
    UsbId::parse(&v.to_string()).ok_or_else(|| E::invalid_value(Unexpected::Unsigned(v), &self))
  }

  fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
  where
    E: de::Error,
  {
    match u64::try_from(v) {
      Ok(v) => self.visit_u64(v),
      Err(_) => Err(E::invalid_value(Unexpected::Signed(v), &self)),
    }
  }

  fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
  where
    E: de::Error,
  {
    UsbId::parse(v).ok_or_else(|| E::invalid_value(Unexpected::Str(v), &self))
  }
}

impl<'de> Deserialize<'de> for UsbId {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    deserializer.deserialize_str(UsbIdVisitor)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbSpec {
  pub vendor: UsbId,
  pub product: UsbId,

  /// Matched literally against the device `serial` attribute.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub serial: Option<String>,
}

use std::path::Path;

use super::{Config, DeviceSpec};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::{fs, io};
use tracing::{event, Level};

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ConfigFormat {
  Json,
  Yaml,
  Toml,
  Auto,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Invalid config file extension when using auto format: {0}")]
  InvalidExtension(String),

  #[error("Config file does not have a file extension, and format is set to auto")]
  MissingExtension,

  #[error("Failed to parse config file")]
  ParseError(#[from] FormatError),

  #[error(transparent)]
  Io(#[from] io::Error),

  #[error("Invalid domain {0:?}, expected a DNS-1123 subdomain")]
  InvalidDomain(String),

  #[error("Invalid device name {0:?}, expected lower case alphanumerics and '-'")]
  InvalidName(String),

  #[error("No devices configured")]
  NoDevices,

  #[error("Device {0:?} has no groups")]
  NoGroups(String),

  #[error("Invalid path pattern {pattern:?}")]
  InvalidGlob {
    pattern: String,
    #[source]
    source: glob::PatternError,
  },

  #[error("Resource {0:?} is configured more than once")]
  DuplicateResource(String),
}

#[derive(Debug, Error)]
pub enum FormatError {
  #[error(transparent)]
  JsonError(#[from] serde_json::Error),

  #[error(transparent)]
  YamlError(#[from] serde_yaml::Error),

  #[error(transparent)]
  TomlError(#[from] toml::de::Error),
}

trait ConfigParser {
  fn parse<T: DeserializeOwned>(content: &[u8]) -> Result<T, FormatError>;
}

struct Json;
impl ConfigParser for Json {
  fn parse<T: DeserializeOwned>(content: &[u8]) -> Result<T, FormatError> {
    Ok(serde_json::from_slice(content)?)
  }
}

struct Yaml;
impl ConfigParser for Yaml {
  fn parse<T: DeserializeOwned>(content: &[u8]) -> Result<T, FormatError> {
    Ok(serde_yaml::from_slice(content)?)
  }
}

struct Toml;
impl ConfigParser for Toml {
  fn parse<T: DeserializeOwned>(content: &[u8]) -> Result<T, FormatError> {
    Ok(toml::from_slice(content)?)
  }
}

fn parse_config(file: &Path, content: &[u8], format: ConfigFormat) -> Result<Config, ConfigError> {
  match format {
    ConfigFormat::Json => Ok(Json::parse(content)?),
    ConfigFormat::Yaml => Ok(Yaml::parse(content)?),
    ConfigFormat::Toml => Ok(Toml::parse(content)?),
    ConfigFormat::Auto => match file.extension().and_then(|e| e.to_str()) {
      Some("toml") => Ok(Toml::parse(content)?),
      Some("yaml") | Some("yml") => Ok(Yaml::parse(content)?),
      Some("json") => Ok(Json::parse(content)?),
      Some(other) => Err(ConfigError::InvalidExtension(other.into())),
      None => Err(ConfigError::MissingExtension),
    },
  }
}

pub(super) async fn read_config(
  file: impl AsRef<Path>,
  format: ConfigFormat,
) -> Result<Config, ConfigError> {
  let file = file.as_ref();
  let result = match fs::read(file).await {
    Ok(content) => parse_config(file, &content, format),
    Err(e) => Err(e.into()),
  };

  match result {
    Ok(config) => {
      event!(
        target: "generic-device-plugin",
        Level::INFO,
        file = %file.display(),
        devices = config.devices().len(),
        "Loaded configuration");
      Ok(config)
    }
    Err(error) => {
      event!(
        target: "generic-device-plugin",
        Level::ERROR,
        file = %file.display(),
        ?error,
        "Failed to read config file");
      Err(error)
    }
  }
}

/// Parses one device given on the command line. YAML, so JSON works too.
pub fn parse_device(value: &str) -> Result<DeviceSpec, ConfigError> {
  Ok(Yaml::parse(value.as_bytes())?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{GroupMembers, PathType};
  use std::fs;

  #[tokio::test]
  async fn reads_each_format_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = dir.path().join("config.yaml");
    let json = dir.path().join("config.json");
    let toml = dir.path().join("config.toml");

    fs::write(
      &yaml,
      "domain: example.com\ndevices:\n  - name: fuse\n    groups:\n      - paths:\n          - path: /dev/fuse\n        count: 10\n",
    )
    .unwrap();
    fs::write(
      &json,
      r#"{"devices": [{"name": "fuse", "groups": [{"paths": [{"path": "/dev/fuse"}], "count": 10}]}]}"#,
    )
    .unwrap();
    fs::write(
      &toml,
      "[[devices]]\nname = \"fuse\"\n[[devices.groups]]\ncount = 10\n[[devices.groups.paths]]\npath = \"/dev/fuse\"\n",
    )
    .unwrap();

    for file in [&yaml, &json, &toml] {
      let config = read_config(file, ConfigFormat::Auto).await.unwrap();
      let device = &config.devices()[0];
      assert_eq!(device.name, "fuse");
      assert_eq!(device.groups[0].count, 10);
    }

    let config = read_config(&yaml, ConfigFormat::Auto).await.unwrap();
    assert_eq!(config.domain(), "example.com");
  }

  #[tokio::test]
  async fn auto_format_needs_a_known_extension() {
    let dir = tempfile::tempdir().unwrap();
    let ini = dir.path().join("config.ini");
    let bare = dir.path().join("config");
    fs::write(&ini, "devices: []\n").unwrap();
    fs::write(&bare, "devices: []\n").unwrap();

    assert!(matches!(
      read_config(&ini, ConfigFormat::Auto).await,
      Err(ConfigError::InvalidExtension(ext)) if ext == "ini"
    ));
    assert!(matches!(
      read_config(&bare, ConfigFormat::Auto).await,
      Err(ConfigError::MissingExtension)
    ));
    assert!(read_config(&bare, ConfigFormat::Yaml).await.is_ok());
  }

  #[test]
  fn device_flag_accepts_yaml_and_json() {
    let yaml = parse_device("{name: serial, groups: [{paths: [{path: /dev/ttyUSB*, mountPath: /dev/serial/}]}]}")
      .unwrap();
    let json = parse_device(r#"{"name": "serial", "groups": [{"paths": [{"path": "/dev/ttyUSB*", "mountPath": "/dev/serial/"}]}]}"#)
      .unwrap();
    assert_eq!(yaml, json);

    match &yaml.groups[0].members {
      GroupMembers::Paths(paths) => {
        assert_eq!(paths[0].mount_path, "/dev/serial/");
        assert_eq!(paths[0].kind, PathType::Device);
      }
      other => panic!("unexpected members {:?}", other),
    }
  }
}

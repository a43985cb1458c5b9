use crate::config::{self, parse_device, DeviceSpec};
use clap::{Parser, ValueEnum};
use std::{net::SocketAddr, path::PathBuf};

#[derive(ValueEnum, Debug, PartialEq, Clone, Copy)]
pub enum LogFormat {
  Pretty,
  Json,
}

#[derive(ValueEnum, Debug, PartialEq, Clone, Copy)]
pub enum LogLevel {
  Error,
  Warn,
  Info,
  Debug,
  Trace,
}

impl From<LogLevel> for tracing::Level {
  fn from(level: LogLevel) -> Self {
    match level {
      LogLevel::Error => tracing::Level::ERROR,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Trace => tracing::Level::TRACE,
    }
  }
}

#[derive(ValueEnum, Debug, PartialEq, Clone, Copy)]
pub enum ConfigFormat {
  Json,
  Yaml,
  Toml,
  Auto,
}

impl From<ConfigFormat> for config::ConfigFormat {
  fn from(f: ConfigFormat) -> Self {
    match f {
      ConfigFormat::Json => config::ConfigFormat::Json,
      ConfigFormat::Yaml => config::ConfigFormat::Yaml,
      ConfigFormat::Toml => config::ConfigFormat::Toml,
      ConfigFormat::Auto => config::ConfigFormat::Auto,
    }
  }
}

#[derive(Parser, Debug)]
#[clap(
  name = "generic-device-plugin",
  version,
  about = "Advertises arbitrary host devices to kubelet"
)]
pub struct Args {
  /// Log output format
  #[clap(
    value_enum,
    long = "log-format",
    short = 'f',
    env = "LOG_FORMAT",
    default_value = "pretty"
  )]
  pub log_format: LogFormat,

  /// Base log level; `RUST_LOG` directives still apply on top
  #[clap(
    value_enum,
    long = "log-level",
    short = 'l',
    env = "LOG_LEVEL",
    default_value = "info"
  )]
  pub log_level: LogLevel,

  /// Config file format
  #[clap(
    value_enum,
    long = "config-format",
    short = 't',
    env = "CONFIG_FILE_FORMAT",
    default_value = "auto"
  )]
  pub config_format: ConfigFormat,

  /// Configuration file path; the default locations are tried when omitted
  #[clap(long = "config", short = 'c', env = "CONFIG_FILE")]
  pub config_file: Option<PathBuf>,

  /// Domain resources are advertised under [default: squat.ai]
  #[clap(long = "domain", env = "DOMAIN")]
  pub domain: Option<String>,

  /// A device to advertise, as YAML or JSON; replaces the devices of the config file
  #[clap(long = "device", short = 'd', env = "DEVICE", value_parser = parse_device)]
  pub devices: Vec<DeviceSpec>,

  /// Directory kubelet watches for device plugin sockets
  #[clap(
    long = "plugin-directory",
    env = "PLUGIN_DIRECTORY",
    default_value = "/var/lib/kubelet/device-plugins/"
  )]
  pub plugin_directory: PathBuf,

  /// Address serving health and metrics
  #[clap(long = "listen", env = "LISTEN", default_value = "0.0.0.0:8080")]
  pub listen: SocketAddr,

  /// Root of the host filesystem as seen by this process
  #[clap(long = "host-root", env = "HOST_ROOT", default_value = "/")]
  pub host_root: PathBuf,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::GroupMembers;

  #[test]
  fn defaults() {
    let args = Args::try_parse_from(["generic-device-plugin"]).unwrap();
    assert_eq!(args.log_format, LogFormat::Pretty);
    assert_eq!(args.log_level, LogLevel::Info);
    assert_eq!(args.config_format, ConfigFormat::Auto);
    assert_eq!(args.config_file, None);
    assert_eq!(args.domain, None);
    assert!(args.devices.is_empty());
    assert_eq!(args.plugin_directory, PathBuf::from("/var/lib/kubelet/device-plugins/"));
    assert_eq!(args.listen, "0.0.0.0:8080".parse().unwrap());
    assert_eq!(args.host_root, PathBuf::from("/"));
  }

  #[test]
  fn repeated_devices() {
    let args = Args::try_parse_from([
      "generic-device-plugin",
      "--domain",
      "example.com",
      "-d",
      "{\"name\": \"fuse\", \"groups\": [{\"paths\": [{\"path\": \"/dev/fuse\"}]}]}",
      "--device",
      "name: yubikey\ngroups:\n  - usb:\n      - vendor: \"1050\"\n        product: \"0407\"\n",
      "-t",
      "toml",
    ])
    .unwrap();

    assert_eq!(args.domain.as_deref(), Some("example.com"));
    assert_eq!(args.config_format, ConfigFormat::Toml);
    assert_eq!(args.devices.len(), 2);
    assert_eq!(args.devices[0].name, "fuse");
    assert!(matches!(args.devices[1].groups[0].members, GroupMembers::Usb(_)));
  }

  #[test]
  fn log_level() {
    let args = Args::try_parse_from(["generic-device-plugin", "--log-level", "debug"]).unwrap();
    assert_eq!(args.log_level, LogLevel::Debug);
    assert_eq!(tracing::Level::from(args.log_level), tracing::Level::DEBUG);

    let args = Args::try_parse_from(["generic-device-plugin", "-l", "warn"]).unwrap();
    assert_eq!(tracing::Level::from(args.log_level), tracing::Level::WARN);

    assert!(Args::try_parse_from(["generic-device-plugin", "--log-level", "loud"]).is_err());
  }

  #[test]
  fn version_flag() {
    let error = Args::try_parse_from(["generic-device-plugin", "--version"]).unwrap_err();
    assert_eq!(error.kind(), clap::error::ErrorKind::DisplayVersion);
    assert!(error.to_string().contains(env!("CARGO_PKG_VERSION")));
  }

  #[test]
  fn invalid_device_is_rejected() {
    assert!(Args::try_parse_from(["generic-device-plugin", "-d", "name: [broken"]).is_err());
  }

  #[test]
  fn formats_map_onto_config_formats() {
    assert_eq!(config::ConfigFormat::from(ConfigFormat::Yaml), config::ConfigFormat::Yaml);
    assert_eq!(config::ConfigFormat::from(ConfigFormat::Auto), config::ConfigFormat::Auto);
  }
}

mod args;
mod device_plugin;
mod http;
mod plugins;
mod supervisor;

use self::{
  args::{Args, LogFormat, LogLevel},
  plugins::PluginRegistry,
};
use crate::{
  config::{Config, ConfigError},
  discovery::UsbScanner,
  metrics::Metrics,
  signals::Signal,
  utils::shutdown_channel,
};
use clap::Parser;
use color_eyre::{
  eyre::{eyre, Context},
  Result,
};
use futures::{future::FusedFuture, pin_mut, select, stream, FutureExt, Stream, StreamExt};
use std::{mem, path::PathBuf, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

enum Action {
  None,
  Restart,
  Shutdown,
}

struct App {
  args: Args,
  config_file: Option<PathBuf>,
  config: Config,
  metrics: Arc<Metrics>,
  plugins: PluginRegistry,
}

impl App {
  async fn new(args: Args) -> Result<Self> {
    let config_file = args.config_file.clone().or_else(Config::find_default_file);
    let config = Self::load(&args, config_file.as_ref()).await?;

    Ok(App {
      args,
      config_file,
      config,
      metrics: Metrics::new(),
      plugins: PluginRegistry::default(),
    })
  }

  /// Reads the file (if any), applies command line overrides and validates
  /// the result.
  async fn load(args: &Args, config_file: Option<&PathBuf>) -> Result<Config> {
    let file_config = match config_file {
      Some(file) => Config::read(file, args.config_format.into()).await?,
      None => {
        event!(
          target: "generic-device-plugin",
          Level::INFO,
          "No config file found, using command line devices only");
        Config::default()
      }
    };

    Self::finish(args, &file_config)
  }

  fn finish(args: &Args, file_config: &Config) -> Result<Config> {
    let config = file_config.with_overrides(args.domain.clone(), args.devices.clone());
    config.validate().wrap_err("invalid configuration")?;

    if config.devices().iter().any(|device| device.uses_usb()) {
      UsbScanner::new(&args.host_root)
        .ensure_available()
        .wrap_err("USB devices are configured")?;
    }

    Ok(config)
  }

  fn config_updates(&self) -> Result<impl Stream<Item = Result<Config, ConfigError>>> {
    let updates = match &self.config_file {
      Some(file) => Config::watch(file.clone(), self.args.config_format.into())
        .wrap_err("failed to watch config file")?
        .left_stream(),
      None => stream::pending::<Result<Config, ConfigError>>().right_stream(),
    };

    Ok(updates)
  }

  async fn run(&mut self) -> Result<()> {
    let config_stream = self.config_updates()?.fuse();
    pin_mut!(config_stream);

    let signal_stream = Signal::watch()?.fuse();
    pin_mut!(signal_stream);

    let (http_trigger, http_shutdown) = shutdown_channel();
    let http: JoinHandle<hyper::Result<()>> = tokio::spawn(http::serve(
      self.args.listen,
      Arc::clone(&self.metrics),
      http_shutdown,
    ));
    let http_exit = http.fuse();
    pin_mut!(http_exit);

    let mut action = Action::Restart;
    let result = loop {
      let next = match action {
        Action::Shutdown => break Ok(()),
        Action::Restart => self.restart().await,
        Action::None => select! {
          c = config_stream.next() => self.on_config(c).await,
          s = signal_stream.next() => self.on_signal(s).await,
          h = http_exit => Self::on_http_exit(h),
        },
      };

      action = match next {
        Ok(action) => action,
        Err(e) => break Err(e),
      };
    };

    http_trigger.trigger();
    if !http_exit.is_terminated() {
      let _ = http_exit.as_mut().await;
    }

    self.stop_plugins().await;
    result
  }

  async fn restart(&mut self) -> Result<Action> {
    let previous = mem::take(&mut self.plugins);
    if !previous.is_empty() {
      event!(
        target: "generic-device-plugin",
        Level::INFO,
        plugins = previous.len(),
        "Stopping device plugins");
      previous.stop().await.wrap_err("failed to stop device plugins")?;
    }

    self.plugins = PluginRegistry::start(
      &self.config,
      &self.args.host_root,
      &self.args.plugin_directory,
      &self.metrics,
    );
    event!(
      target: "generic-device-plugin",
      Level::INFO,
      plugins = self.plugins.len(),
      domain = %self.config.domain(),
      "Device plugins started");

    Ok(Action::None)
  }

  async fn on_config(&mut self, config: Option<Result<Config, ConfigError>>) -> Result<Action> {
    match config {
      None => {
        event!(
          target: "generic-device-plugin",
          Level::ERROR,
          "Config watcher closed."
        );

        Err(eyre!("config watcher closed")).context("on_config")
      }

      // the error was logged while reading
      Some(Err(_)) => Ok(Action::None),

      Some(Ok(c)) => match Self::finish(&self.args, &c) {
        Ok(config) if config == self.config => Ok(Action::None),
        Ok(config) => {
          event!(target: "generic-device-plugin", Level::INFO, "Config changed, restarting");
          self.config = config;
          Ok(Action::Restart)
        }
        Err(e) => {
          event!(
            target: "generic-device-plugin",
            Level::ERROR,
            "Ignoring new config, keeping the running plugins: {:?}",
            e
          );
          Ok(Action::None)
        }
      },
    }
  }

  async fn on_signal(&mut self, signal: Option<Signal>) -> Result<Action> {
    match signal {
      None => {
        event!(
          target: "generic-device-plugin",
          Level::ERROR,
          "Signal stream stopped, shutting down.",
        );

        Err(eyre!("signal stream stopped")).context("on_signal")
      }

      Some(s) if s.is_reload() => {
        event!(target: "generic-device-plugin", Level::INFO, "Received {}, reloading", s);
        let config = match &self.config_file {
          Some(file) => Config::read(file, self.args.config_format.into()).await,
          None => Ok(Config::default()),
        };

        self.on_config(Some(config)).await.map(|action| match action {
          // an unchanged config still restarts on request
          Action::None => Action::Restart,
          other => other,
        })
      }

      Some(s) => {
        event!(
          target: "generic-device-plugin",
          Level::INFO,
          "Received signal {}, shutting down.",
          s
        );
        Ok(Action::Shutdown)
      }
    }
  }

  fn on_http_exit(result: Result<hyper::Result<()>, tokio::task::JoinError>) -> Result<Action> {
    let error = match result {
      Ok(Ok(())) => eyre!("health server stopped"),
      Ok(Err(e)) => eyre!(e).wrap_err("health server failed"),
      Err(e) => eyre!(e).wrap_err("health server panicked"),
    };

    event!(target: "generic-device-plugin", Level::ERROR, "{:?}", error);
    Err(error)
  }

  async fn stop_plugins(&mut self) {
    let plugins = mem::take(&mut self.plugins);
    if let Err(e) = plugins.stop().await {
      event!(
        target: "generic-device-plugin",
        Level::ERROR,
        "Failed to stop device plugins: {:?}",
        e
      );
    }
  }
}

fn log_filter(level: LogLevel) -> EnvFilter {
  EnvFilter::from_default_env()
    // Set the base level when not matched by other directives.
    .add_directive(tracing::Level::from(level).into())
}

fn init_logging(format: LogFormat, level: LogLevel) {
  let filter = log_filter(level);

  match format {
    LogFormat::Pretty => {
      tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    LogFormat::Json => {
      tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .with_span_list(false)
        .init();
    }
  }
}

pub async fn run() -> Result<()> {
  let args = Args::parse();
  init_logging(args.log_format, args.log_level);

  event!(target: "generic-device-plugin", Level::INFO, "Starting generic-device-plugin");
  let mut app = App::new(args).await?;
  app.run().await
}

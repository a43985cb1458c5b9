use super::{Config, ConfigError, ConfigFormat};
use async_stream::stream;
use futures::{Stream, StreamExt};
use notify::{DebouncedEvent, RecursiveMode, Watcher as WatcherTrait};
use pin_project::pin_project;
use std::{
  path::{Path, PathBuf},
  pin::Pin,
  task::{Context, Poll},
  time::Duration,
};
use thiserror::Error;
use tokio::{io, sync::mpsc::UnboundedReceiver};
use tracing::{event, Level};

const DEBOUNCE: Duration = Duration::from_secs(2);

/// Bridges notify's blocking channel onto the runtime.
#[pin_project]
struct Watcher {
  watcher: notify::RecommendedWatcher,

  #[pin]
  receiver: UnboundedReceiver<DebouncedEvent>,
}

impl Watcher {
  fn new(delay: Duration) -> Result<Self, ConfigWatcherError> {
    let (std_sender, std_receiver) = std::sync::mpsc::channel();
    let (async_sender, async_receiver) = tokio::sync::mpsc::unbounded_channel();
    let watcher = notify::watcher(std_sender, delay)?;
    std::thread::Builder::new()
      .name("config-watcher".into())
      .spawn(move || {
        for evt in std_receiver {
          if async_sender.send(evt).is_err() {
            break;
          }
        }
      })?;

    Ok(Self {
      watcher,
      receiver: async_receiver,
    })
  }

  fn watch(
    &mut self,
    path: impl AsRef<Path>,
    recursive_mode: RecursiveMode,
  ) -> Result<(), ConfigWatcherError> {
    Ok(self.watcher.watch(path, recursive_mode)?)
  }
}

impl Stream for Watcher {
  type Item = DebouncedEvent;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.receiver.poll_recv(cx)
  }
}

#[derive(Debug, Error)]
pub enum ConfigWatcherError {
  #[error(transparent)]
  Notify(#[from] notify::Error),

  #[error(transparent)]
  Io(#[from] io::Error),
}

/// Whether `event` replaced or rewrote `file`.
fn touches(event: &DebouncedEvent, file: &Path) -> bool {
  match event {
    DebouncedEvent::Write(path) | DebouncedEvent::Create(path) => path == file,
    DebouncedEvent::Rename(_, to) => to == file,
    _ => false,
  }
}

/// Re-reads `file` every time it changes. The parent directory is watched
/// rather than the file itself so editors that save by renaming a new file
/// into place are picked up too.
pub fn watch(
  file: impl AsRef<Path>,
  format: ConfigFormat,
) -> Result<impl Stream<Item = Result<Config, ConfigError>>, ConfigWatcherError> {
  let file = file.as_ref().canonicalize()?;
  let dir = file
    .parent()
    .map(Path::to_owned)
    .unwrap_or_else(|| PathBuf::from("/"));

  let mut watcher = Watcher::new(DEBOUNCE)?;
  watcher.watch(&dir, RecursiveMode::NonRecursive)?;
  event!(
    target: "generic-device-plugin",
    Level::DEBUG,
    file = %file.display(),
    "Watching config file");

  Ok(stream! {
    while let Some(event) = watcher.next().await {
      if touches(&event, &file) {
        yield Config::read(&file, format).await;
      }
    }
  })
}

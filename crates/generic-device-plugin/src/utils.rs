use color_eyre::{eyre::eyre, Report, Result};
use std::{error::Error as StdError, fmt::Write};
use tokio::sync::watch;

pub trait AggregateErrorExt {
  /// Succeeds when every item succeeded; otherwise reports the single error,
  /// or all of them folded into one report.
  fn collect_errors(self) -> Result<()>;
}

impl<I, E> AggregateErrorExt for I
where
  I: IntoIterator<Item = Result<(), E>>,
  E: StdError + Send + Sync + 'static,
{
  fn collect_errors(self) -> Result<()> {
    let mut errors: Vec<E> = self.into_iter().filter_map(|r| r.err()).collect();
    match errors.len() {
      0 => Ok(()),
      1 => Err(Report::new(errors.remove(0))),
      n => {
        let mut message = format!("{} operations failed:", n);
        for error in &errors {
          let _ = write!(message, "\n  - {}", error);
        }

        Err(eyre!(message))
      }
    }
  }
}

/// Fires a [`Shutdown`] once. Dropping the trigger fires it as well.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Cloneable view of a shutdown request.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
  let (sender, receiver) = watch::channel(false);
  (ShutdownTrigger(sender), Shutdown(receiver))
}

impl ShutdownTrigger {
  pub fn trigger(&self) {
    self.0.send_replace(true);
  }
}

impl Shutdown {
  #[cfg(test)]
  pub fn is_triggered(&self) -> bool {
    *self.0.borrow()
  }

  /// Resolves once shutdown was requested.
  pub async fn wait(&self) {
    let mut receiver = self.0.clone();
    while !*receiver.borrow_and_update() {
      if receiver.changed().await.is_err() {
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{fmt, time::Duration};

  #[derive(Debug)]
  struct Failed(&'static str);

  impl fmt::Display for Failed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.0)
    }
  }

  impl StdError for Failed {}

  #[test]
  fn collect_errors() {
    assert!(vec![Ok::<(), Failed>(()), Ok(())].collect_errors().is_ok());

    let single = vec![Ok(()), Err(Failed("socket gone"))].collect_errors();
    assert_eq!(single.unwrap_err().to_string(), "socket gone");

    let many = vec![Err(Failed("a")), Ok(()), Err(Failed("b"))].collect_errors();
    let message = many.unwrap_err().to_string();
    assert!(message.starts_with("2 operations failed:"));
    assert!(message.contains("- a") && message.contains("- b"));
  }

  #[tokio::test]
  async fn shutdown_wakes_every_waiter() {
    let (trigger, shutdown) = shutdown_channel();
    let waiter = {
      let shutdown = shutdown.clone();
      tokio::spawn(async move { shutdown.wait().await })
    };

    assert!(!shutdown.is_triggered());
    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .unwrap()
      .unwrap();
    assert!(shutdown.is_triggered());

    // waiting after the fact returns immediately
    shutdown.wait().await;
  }

  #[tokio::test]
  async fn dropped_trigger_counts_as_shutdown() {
    let (trigger, shutdown) = shutdown_channel();
    drop(trigger);

    tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
      .await
      .unwrap();
  }
}

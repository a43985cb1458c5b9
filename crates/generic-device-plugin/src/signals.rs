use futures::{future::ready, Stream, StreamExt};
use signal_hook_tokio::Signals;
use std::{convert::TryFrom, fmt, io};
use tracing::{event, Level};

macro_rules! define_signals {
  (
    pub enum $name:ident {
      $($case:ident = $val:ident),+
      $(,)?
    }
  ) => {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(i32)]
    pub enum $name {
      $($case = ::signal_hook::consts::$val,)+
    }

    impl TryFrom<i32> for $name {
      type Error = i32;

      fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
          $(::signal_hook::consts::$val => Ok(Self::$case),)+
          other => Err(other),
        }
      }
    }

    impl $name {
      const ALL: &'static [i32] = &[$(::signal_hook::consts::$val,)+];

      pub fn name(self) -> &'static str {
        match self {
          $(Self::$case => stringify!($val),)+
        }
      }
    }
  };
}

define_signals! {
  pub enum Signal {
    Term = SIGTERM,
    Int = SIGINT,
    Quit = SIGQUIT,
    Hup = SIGHUP,
  }
}

impl fmt::Display for Signal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl Signal {
  /// SIGHUP reloads the configuration, everything else stops the process.
  pub fn is_reload(self) -> bool {
    matches!(self, Signal::Hup)
  }

  pub fn watch() -> io::Result<impl Stream<Item = Signal>> {
    let signals = Signals::new(Self::ALL)?;
    event!(target: "generic-device-plugin", Level::DEBUG, "Started listening for signals");

    Ok(signals.filter_map(|s| ready(Signal::try_from(s).ok())))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn maps_raw_signal_numbers() {
    assert_eq!(Signal::try_from(signal_hook::consts::SIGHUP), Ok(Signal::Hup));
    assert_eq!(Signal::try_from(signal_hook::consts::SIGTERM), Ok(Signal::Term));
    assert_eq!(
      Signal::try_from(signal_hook::consts::SIGUSR1),
      Err(signal_hook::consts::SIGUSR1)
    );
  }

  #[test]
  fn only_hangup_reloads() {
    assert!(Signal::Hup.is_reload());
    assert!(!Signal::Int.is_reload());
    assert_eq!(Signal::Quit.to_string(), "SIGQUIT");
  }
}

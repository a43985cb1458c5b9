use super::DiscoveryError;
use std::path::PathBuf;
use tracing::{event, Level};

/// Expands glob patterns against a filesystem rooted at `root`. Matches are
/// reported as absolute paths relative to that root, so a resolver rooted at
/// a scratch directory behaves exactly like one rooted at `/`.
#[derive(Debug, Clone)]
pub struct PathResolver {
  root: PathBuf,
}

impl PathResolver {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn rooted_pattern(&self, pattern: &str) -> String {
    let root = self.root.to_string_lossy();
    let root = glob::Pattern::escape(root.trim_end_matches('/'));
    let pattern = pattern.trim_start_matches('/');

    format!("{}/{}", root, pattern)
  }

  /// Returns every existing path matching `pattern`, sorted. Entries that
  /// cannot be read while walking are skipped.
  pub fn resolve(&self, pattern: &str) -> Result<Vec<String>, DiscoveryError> {
    let rooted = self.rooted_pattern(pattern);
    let entries = glob::glob(&rooted).map_err(|source| DiscoveryError::Glob {
      pattern: pattern.to_owned(),
      source,
    })?;

    let mut found = Vec::new();
    for entry in entries {
      match entry {
        Ok(path) => {
          let relative = path.strip_prefix(&self.root).unwrap_or(&path);
          found.push(format!("/{}", relative.to_string_lossy().trim_start_matches('/')));
        }
        Err(error) => event!(
          target: "generic-device-plugin",
          Level::TRACE,
          path = %error.path().display(),
          %error,
          "skipping unreadable path"),
      }
    }

    found.sort();
    Ok(found)
  }
}

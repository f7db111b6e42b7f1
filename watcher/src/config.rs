//! Configuration types and configuration file watching.

use std::borrow::Cow;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{Result, WatcherError};
use crate::schedule::OffsetSource;

/// What to watch and when.
///
/// Serialized with the keys `Path` and `Cron`; lower-case keys are accepted
/// as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Directory to watch, absolute or relative to the base directory.
    #[serde(rename = "Path", alias = "path")]
    pub path: PathBuf,

    /// Five-field cron expression in local time.
    #[serde(rename = "Cron", alias = "cron")]
    pub cron: String,
}

impl WatchConfig {
    /// Create a new watch config.
    pub fn new(path: impl Into<PathBuf>, cron: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cron: cron.into(),
        }
    }

    /// Read a JSON configuration file.
    pub fn load(file: impl AsRef<Path>) -> Result<Self> {
        let file = file.as_ref();
        let text = std::fs::read_to_string(file).map_err(|e| {
            WatcherError::Config(format!("cannot read {}: {e}", file.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The watched directory as an absolute, normalized path.
    pub fn resolve_path(&self, base_dir: &Path) -> PathBuf {
        self.path
            .absolutize_from(base_dir)
            .map(Cow::into_owned)
            .unwrap_or_else(|_| base_dir.join(&self.path))
    }
}

/// Tuning for the watch controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Relative configuration paths are resolved against this directory.
    pub base_dir: PathBuf,

    /// Reload signals closer than this to the last accepted one are dropped.
    pub debounce: Duration,

    /// Longest single sleep of the activation timer.
    pub max_tick: Duration,

    /// Where the local time zone offset comes from.
    pub offsets: OffsetSource,
}

impl ControllerOptions {
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_max_tick(mut self, max_tick: Duration) -> Self {
        self.max_tick = max_tick;
        self
    }

    pub fn with_offsets(mut self, offsets: OffsetSource) -> Self {
        self.offsets = offsets;
        self
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            debounce: Duration::from_secs(1),
            max_tick: Duration::from_secs(30),
            offsets: OffsetSource::Local,
        }
    }
}

/// Request to reload the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSignal {
    /// When the change was observed.
    pub at: Instant,
}

impl ReloadSignal {
    pub fn now() -> Self {
        Self { at: Instant::now() }
    }
}

/// Watches a configuration file and emits a [`ReloadSignal`] whenever it
/// is written or replaced. Dropping the handle stops watching.
pub struct ConfigWatcher {
    file: PathBuf,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `file`.
    ///
    /// The parent directory is watched rather than the file itself so that
    /// editors that save by replacing the file keep triggering reloads.
    pub fn spawn(file: impl AsRef<Path>) -> Result<(Self, mpsc::Receiver<ReloadSignal>)> {
        let file = file.as_ref().absolutize()?.into_owned();
        let dir = file
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| WatcherError::Config(format!("{} has no parent", file.display())))?;
        let name: OsString = file
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| WatcherError::Config(format!("{} is not a file", file.display())))?;

        let (tx, rx) = mpsc::channel(16);
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                        && event
                            .paths
                            .iter()
                            .any(|path| path.file_name() == Some(name.as_os_str()));
                    if relevant && tx.try_send(ReloadSignal::now()).is_err() {
                        debug!("reload signal dropped, reload queue full");
                    }
                }
                Err(e) => error!("configuration watch error: {e}"),
            },
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!("Watching configuration file {}", file.display());

        Ok((
            Self {
                file,
                _watcher: watcher,
            },
            rx,
        ))
    }

    /// The watched file.
    pub fn file(&self) -> &Path {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_accepts_both_key_styles() {
        let temp_dir = TempDir::new().unwrap();
        let pascal = temp_dir.path().join("pascal.json");
        let lower = temp_dir.path().join("lower.json");
        fs::write(&pascal, r#"{"Path": "./inbox", "Cron": "* 9-17 * * 1-5"}"#).unwrap();
        fs::write(&lower, r#"{"path": "./inbox", "cron": "* 9-17 * * 1-5"}"#).unwrap();

        let expected = WatchConfig::new("./inbox", "* 9-17 * * 1-5");
        assert_eq!(WatchConfig::load(&pascal).unwrap(), expected);
        assert_eq!(WatchConfig::load(&lower).unwrap(), expected);
    }

    #[test]
    fn test_load_reports_bad_files() {
        let temp_dir = TempDir::new().unwrap();
        let broken = temp_dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();

        assert!(matches!(
            WatchConfig::load(&broken),
            Err(WatcherError::Serialization(_))
        ));
        assert!(matches!(
            WatchConfig::load(temp_dir.path().join("missing.json")),
            Err(WatcherError::Config(_))
        ));
    }

    #[test]
    fn test_resolve_path_normalizes_relative_paths() {
        let base = Path::new("/srv/app");

        assert_eq!(
            WatchConfig::new("../data/./inbox", "* * * * *").resolve_path(base),
            PathBuf::from("/srv/data/inbox")
        );
        assert_eq!(
            WatchConfig::new("/var/drop", "* * * * *").resolve_path(base),
            PathBuf::from("/var/drop")
        );
    }

    #[tokio::test]
    async fn test_config_watcher_signals_on_write() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("appsettings.json");
        fs::write(&file, r#"{"Path": ".", "Cron": "* * * * *"}"#).unwrap();

        let (watcher, mut signals) = ConfigWatcher::spawn(&file).unwrap();
        assert!(watcher.file().ends_with("appsettings.json"));

        fs::write(&file, r#"{"Path": ".", "Cron": "0 9 * * *"}"#).unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(10), signals.recv()).await;
        assert!(matches!(signal, Ok(Some(_))));
    }
}

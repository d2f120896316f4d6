//! Hot reload of the configuration file.
//!
//! Editors and `write` calls often produce several events for one save, and
//! some of them see a half-written file. Every event reloads and validates
//! the file; only a valid configuration that differs from the last one
//! published reaches the server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ServiceConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Publishes reloaded configurations of one file.
pub struct ConfigWatcher {
    path: PathBuf,
    updates: mpsc::UnboundedSender<ServiceConfig>,
    current: Option<ServiceConfig>,
}

impl ConfigWatcher {
    /// Create a watcher and the receiver its updates are sent to.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ServiceConfig>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            updates,
            current: None,
        };
        (watcher, rx)
    }

    /// Treat `config` as already applied; saves that leave it unchanged are not published.
    pub fn with_current(mut self, config: ServiceConfig) -> Self {
        self.current = Some(config);
        self
    }

    /// Start watching. Dropping the returned watcher stops it.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let mut reloader = Reloader {
            path: self.path,
            updates: self.updates,
            current: self.current,
        };

        let mut watcher = RecommendedWatcher::new(
            move |event: notify::Result<Event>| match event {
                Ok(event) if is_write(&event.kind) => reloader.reload(),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %path.display(), "Watching config file");
        Ok(watcher)
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Modify(_) | EventKind::Create(_))
}

struct Reloader {
    path: PathBuf,
    updates: mpsc::UnboundedSender<ServiceConfig>,
    current: Option<ServiceConfig>,
}

impl Reloader {
    fn reload(&mut self) {
        let config = match load_config(&self.path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring invalid config change");
                return;
            }
        };
        if self.current.as_ref() == Some(&config) {
            return;
        }

        tracing::info!(path = %self.path.display(), "Config file reloaded");
        if self.updates.send(config.clone()).is_err() {
            tracing::debug!("Config receiver dropped");
        }
        self.current = Some(config);
    }
}

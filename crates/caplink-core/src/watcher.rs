//! Hot-reload support for server configuration changes
//!
//! Watches the servers config file and surfaces change events so a caller
//! can trigger a registry reload.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

/// Event types for configuration changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChangeEvent {
    /// The config file was modified
    Modified(PathBuf),
    /// The config file was created
    Created(PathBuf),
    /// The config file was deleted
    Deleted(PathBuf),
}

/// Watcher for the servers config file
pub struct ConfigWatcher {
    #[allow(dead_code)]
    watcher: RecommendedWatcher,
    receiver: Receiver<std::result::Result<Event, notify::Error>>,
    config_path: PathBuf,
    watch_dir: PathBuf,
}

impl ConfigWatcher {
    /// Create a watcher for the given config file.
    ///
    /// The parent directory is watched rather than the file itself, so
    /// creation and deletion of the file are observed too.
    pub fn new(config_path: &Path) -> Result<Self> {
        let (tx, rx) = channel();

        let watcher = RecommendedWatcher::new(
            move |result| {
                let _ = tx.send(result);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| CoreError::Config(format!("failed to create file watcher: {}", e)))?;

        let watch_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| CoreError::Config("config path has no parent directory".to_string()))?;

        Ok(Self {
            watcher,
            receiver: rx,
            config_path: config_path.to_path_buf(),
            watch_dir,
        })
    }

    /// Start watching the config file's directory
    pub fn start(&mut self) -> Result<()> {
        self.watcher
            .watch(&self.watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| CoreError::Config(format!("failed to start file watcher: {}", e)))?;
        info!(path = ?self.config_path, "Started watching server config for changes");
        Ok(())
    }

    /// Stop watching
    pub fn stop(&mut self) -> Result<()> {
        self.watcher
            .unwatch(&self.watch_dir)
            .map_err(|e| CoreError::Config(format!("failed to stop file watcher: {}", e)))?;
        info!("Stopped watching server config");
        Ok(())
    }

    /// Check for pending change events (non-blocking)
    pub fn poll_events(&self) -> Vec<ConfigChangeEvent> {
        let mut events = Vec::new();

        while let Ok(result) = self.receiver.try_recv() {
            match result {
                Ok(event) => {
                    if let Some(change_event) = self.process_event(event) {
                        events.push(change_event);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "File watcher error");
                }
            }
        }

        events
    }

    /// Wait for the next change event (blocking)
    pub fn wait_for_event(&self) -> Option<ConfigChangeEvent> {
        loop {
            match self.receiver.recv() {
                Ok(Ok(event)) => {
                    if let Some(change_event) = self.process_event(event) {
                        return Some(change_event);
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "File watcher error");
                }
                Err(_) => return None,
            }
        }
    }

    /// Process a notify event into a config change event
    fn process_event(&self, event: Event) -> Option<ConfigChangeEvent> {
        // Directory watch sees sibling files too; keep only ours
        let is_config = event.paths.iter().any(|p| p == &self.config_path);
        if !is_config {
            debug!(paths = ?event.paths, "Ignoring unrelated file event");
            return None;
        }

        match event.kind {
            EventKind::Modify(_) => {
                info!("Server config modified");
                Some(ConfigChangeEvent::Modified(self.config_path.clone()))
            }
            EventKind::Create(_) => {
                info!("Server config created");
                Some(ConfigChangeEvent::Created(self.config_path.clone()))
            }
            EventKind::Remove(_) => {
                info!("Server config deleted");
                Some(ConfigChangeEvent::Deleted(self.config_path.clone()))
            }
            _ => None,
        }
    }

    /// Path of the watched config file
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_requires_parent_directory() {
        let dir = TempDir::new().unwrap();
        let watcher = ConfigWatcher::new(&dir.path().join("servers.toml"));
        assert!(watcher.is_ok());

        let rootless = ConfigWatcher::new(Path::new("/"));
        assert!(matches!(rootless, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_unrelated_event_is_filtered() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("servers.toml");
        let watcher = ConfigWatcher::new(&config_path).unwrap();

        let event = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(dir.path().join("other.toml"));
        assert!(watcher.process_event(event).is_none());

        let event = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(config_path.clone());
        assert_eq!(
            watcher.process_event(event),
            Some(ConfigChangeEvent::Modified(config_path))
        );
    }

    #[test]
    fn test_start_watches_existing_directory() {
        let dir = TempDir::new().unwrap();
        let mut watcher = ConfigWatcher::new(&dir.path().join("servers.toml")).unwrap();
        watcher.start().unwrap();
        watcher.stop().unwrap();
    }
}

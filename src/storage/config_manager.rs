//! Configuration store
//!
//! Named configuration values come from the process environment and from a
//! `.env`-style file. The file's values live in an in-memory snapshot that is
//! swapped atomically when the file changes on disk. Process environment
//! variables take precedence over the file.

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = ".env";

/// Window during which repeated change notifications are ignored
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Errors that can occur while reading or watching the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] dotenvy::Error),

    #[error("Failed to watch configuration file: {0}")]
    Watch(#[from] notify::Error),
}

/// Result of a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The changed file is not the configuration file
    Ignored,
    /// A reload already happened inside the debounce window
    Debounced,
    /// The file was reloaded, carrying the number of keys read
    Reloaded(usize),
    /// Reloading failed; the previous values are kept
    Failed,
}

/// Process-wide configuration store
pub struct ConfigManager {
    path: PathBuf,
    values: RwLock<Arc<HashMap<String, String>>>,
    debounce: Duration,
    last_trigger: Mutex<Option<DateTime<Utc>>>,
    reloads: AtomicU64,
}

impl ConfigManager {
    /// Create a store backed by `path` and load it immediately
    ///
    /// A missing file is not an error: the store then only serves the
    /// process environment.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let manager = Self {
            path: path.into(),
            values: RwLock::new(Arc::new(HashMap::new())),
            debounce: DEFAULT_DEBOUNCE,
            last_trigger: Mutex::new(None),
            reloads: AtomicU64::new(0),
        };

        if manager.path.exists() {
            match manager.reload() {
                Ok(count) => tracing::info!(
                    "Loaded {} configuration values from {}",
                    count,
                    manager.path.display()
                ),
                Err(e) => tracing::warn!("Failed to load configuration file: {}", e),
            }
        } else {
            tracing::debug!(
                "Configuration file {} not found, using process environment only",
                manager.path.display()
            );
        }

        manager
    }

    /// Store backed by `CONFIG_FILE`, or `.env` in the working directory
    pub fn from_default_location() -> Self {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::new(path)
    }

    /// Override the debounce window
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Look up `key`, environment first, then the file snapshot
    pub fn get(&self, key: &str) -> Option<String> {
        if let Ok(value) = std::env::var(key) {
            return Some(value);
        }
        self.snapshot().get(key).cloned()
    }

    /// Look up `key`, returning `default` when it is absent
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Look up and parse `key`; unparsable values are logged and treated as absent
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
                None
            }
        }
    }

    /// Number of successful reloads since construction
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    /// Re-read the whole file and swap it in
    pub fn reload(&self) -> Result<usize, ConfigError> {
        if !self.path.exists() {
            return Err(ConfigError::Missing(self.path.clone()));
        }

        let mut values = HashMap::new();
        for item in dotenvy::from_path_iter(&self.path)? {
            let (key, value) = item?;
            values.insert(key, value);
        }
        let count = values.len();

        let mut guard = self.values.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(values);
        drop(guard);

        self.reloads.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// File-change callback
    ///
    /// Only reacts to the configuration file itself, and at most once per
    /// debounce window. Errors are logged and never propagated.
    pub fn on_modified(&self, changed: &Path) -> ReloadOutcome {
        if changed.file_name() != self.path.file_name() {
            return ReloadOutcome::Ignored;
        }

        // Held across the reload so concurrent notifications cannot both pass the window check
        let mut last_trigger = self.last_trigger.lock().unwrap_or_else(|e| e.into_inner());

        let now = Utc::now();
        if let Some(last) = *last_trigger {
            let within_window = now
                .signed_duration_since(last)
                .to_std()
                .map(|elapsed| elapsed < self.debounce)
                .unwrap_or(false);
            if within_window {
                tracing::debug!("Configuration change debounced");
                return ReloadOutcome::Debounced;
            }
        }

        match self.reload() {
            Ok(count) => {
                tracing::info!("Configuration file reloaded ({} values)", count);
                *last_trigger = Some(now);
                ReloadOutcome::Reloaded(count)
            }
            Err(e) => {
                tracing::error!("Failed to reload configuration: {}", e);
                ReloadOutcome::Failed
            }
        }
    }

    /// Watch the configuration file's directory and feed changes to [`on_modified`]
    ///
    /// Watching stops when the returned guard is dropped.
    ///
    /// [`on_modified`]: ConfigManager::on_modified
    pub fn watch(self: &Arc<Self>) -> Result<ConfigWatcher, ConfigError> {
        let manager = Arc::clone(self);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                for path in &event.paths {
                    manager.on_modified(path);
                }
            }
            Err(e) => tracing::warn!("Configuration watcher error: {}", e),
        })?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::info!("Watching {} for configuration changes", dir.display());

        Ok(ConfigWatcher { _watcher: watcher })
    }

    fn snapshot(&self) -> Arc<HashMap<String, String>> {
        Arc::clone(&self.values.read().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Keeps a file watcher alive
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

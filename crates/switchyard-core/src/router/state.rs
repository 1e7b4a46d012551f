//! Durable provider/model preference.
//!
//! The preference is a tiny JSON file. Reads tolerate a missing or corrupted
//! file by falling back to defaults; writes go to a uniquely named temp file
//! in the same directory and are renamed into place, so a concurrent reader
//! only ever sees a complete document.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// The persisted provider/model choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterState {
    pub provider: String,
    pub model_id: String,
}

impl RouterState {
    pub fn new(provider: &str, model_id: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to write router state to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize router state: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct Cached {
    state: RouterState,
    loaded_at: Instant,
}

pub struct StateStore {
    path: PathBuf,
    defaults: RouterState,
    ttl: Duration,
    cache: Mutex<Option<Cached>>,
    /// Serializes writers within this process.
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, defaults: RouterState, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            defaults,
            ttl,
            cache: Mutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    pub fn defaults(&self) -> &RouterState {
        &self.defaults
    }

    /// Load the current state. Never fails.
    pub fn load(&self) -> RouterState {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return cached.state.clone();
            }
        }

        let state = self.read_from_disk();
        *cache = Some(Cached {
            state: state.clone(),
            loaded_at: Instant::now(),
        });
        state
    }

    fn read_from_disk(&self) -> RouterState {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No router state yet, using defaults");
                return self.defaults.clone();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read router state");
                return self.defaults.clone();
            }
        };

        match serde_json::from_str::<RouterState>(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Corrupted router state, using defaults"
                );
                self.defaults.clone()
            }
        }
    }

    /// Persist `state` atomically.
    ///
    /// The in-memory copy is updated under the write lock once the write
    /// is done, so the cache ends on the same state as the file. It is
    /// updated even when the disk write fails, so this process keeps
    /// honouring the new preference.
    pub fn save(&self, state: &RouterState) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = self.write_to_disk(state);

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(Cached {
            state: state.clone(),
            loaded_at: Instant::now(),
        });
        result
    }

    fn write_to_disk(&self, state: &RouterState) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(state)?;
        let io_err = |source: std::io::Error| StateError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        // Unique temp name so writers in other processes don't collide.
        let tmp_path = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &self.path)
        };

        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(io_err(e));
        }

        debug!(
            path = %self.path.display(),
            provider = %state.provider,
            model = %state.model_id,
            "Saved router state"
        );
        Ok(())
    }
}

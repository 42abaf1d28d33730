//! Multi-format engine registry: maps a format identifier to exactly one
//! engine instance, lazily constructed and cached for the registry lifetime.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::codec::ChunkReceivedListener;
use crate::engine::{Engine, EngineError};
use crate::era::DEFAULT_CACHE_LOOKBACK;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no engine settings - makes no sense")]
    EmptySettings,
    #[error("sub folders are not allowed: {0}")]
    NestedFolder(String),
    #[error("unknown format: {0}")]
    UnknownFormat(String),
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Explicit configuration: one (format, sub-folder, listener) triple.
pub struct EngineSetting {
    pub format: String,
    pub folder: String,
    pub listener: Arc<dyn ChunkReceivedListener>,
}

struct Slot {
    folder: PathBuf,
    listener: Arc<dyn ChunkReceivedListener>,
    engine: Mutex<Option<Arc<Engine>>>,
}

/// Registry over a root path: one sub-folder per format, engines built once
/// behind a per-slot creation guard.
pub struct EngineRegistry {
    owner: String,
    slots: HashMap<String, Slot>,
    cache_lookback: u32,
}

impl EngineRegistry {
    /// Build from explicit settings. Zero settings is a configuration error;
    /// so is a sub-folder name containing a path separator (checked here,
    /// not at use time).
    pub fn from_settings(
        owner: &str,
        root: &Path,
        settings: Vec<EngineSetting>,
    ) -> Result<Self, RegistryError> {
        if settings.is_empty() {
            return Err(RegistryError::EmptySettings);
        }
        let mut slots = HashMap::new();
        for setting in settings {
            if setting.folder.contains('/') || setting.folder.contains('\\') {
                return Err(RegistryError::NestedFolder(setting.folder));
            }
            slots.insert(
                setting.format,
                Slot {
                    folder: root.join(&setting.folder),
                    listener: setting.listener,
                    engine: Mutex::new(None),
                },
            );
        }
        Ok(EngineRegistry {
            owner: owner.to_string(),
            slots,
            cache_lookback: DEFAULT_CACHE_LOOKBACK,
        })
    }

    /// Rehydrate engines from existing sub-folders of `root`; all share one
    /// listener. Folders without a format marker are skipped with a warning.
    pub fn discover(
        owner: &str,
        root: &Path,
        listener: Arc<dyn ChunkReceivedListener>,
    ) -> Result<Self, RegistryError> {
        if !root.is_dir() {
            return Err(RegistryError::NotADirectory(root.to_path_buf()));
        }
        let mut slots = HashMap::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let folder = entry.path();
            // engines are bound lazily through resolve; load only validates
            // the folder and reads its format marker here
            match Engine::load(owner, &folder) {
                Ok(engine) => {
                    slots.insert(
                        engine.format().to_string(),
                        Slot {
                            folder,
                            listener: listener.clone(),
                            engine: Mutex::new(None),
                        },
                    );
                }
                Err(EngineError::NotAnEngine(_)) => {
                    tracing::warn!(folder = %folder.display(), "skipping folder without format marker");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if slots.is_empty() {
            tracing::warn!(root = %root.display(), "no engines discovered yet");
        }
        Ok(EngineRegistry {
            owner: owner.to_string(),
            slots,
            cache_lookback: DEFAULT_CACHE_LOOKBACK,
        })
    }

    /// Override the era lookback applied to every engine this registry
    /// builds. Call before the first resolution.
    pub fn with_cache_lookback(mut self, lookback: u32) -> Self {
        self.cache_lookback = lookback;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Registered formats, for the handshake interest push.
    pub fn formats(&self) -> Vec<String> {
        let mut out: Vec<String> = self.slots.keys().cloned().collect();
        out.sort();
        out
    }

    /// Engine for `format`; constructed on first resolution and cached, one
    /// instance per format, never rebuilt.
    pub fn resolve(&self, format: &str) -> Result<Arc<Engine>, RegistryError> {
        let slot = self
            .slots
            .get(format)
            .ok_or_else(|| RegistryError::UnknownFormat(format.to_string()))?;
        let mut cached = slot.engine.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(engine) = cached.as_ref() {
            return Ok(engine.clone());
        }
        let mut engine = Engine::create(&self.owner, format, &slot.folder)?;
        engine.set_cache_lookback(self.cache_lookback);
        let engine = Arc::new(engine);
        *cached = Some(engine.clone());
        Ok(engine)
    }

    /// Received-chunk listener configured for `format`.
    pub fn listener(&self, format: &str) -> Result<Arc<dyn ChunkReceivedListener>, RegistryError> {
        self.slots
            .get(format)
            .map(|s| s.listener.clone())
            .ok_or_else(|| RegistryError::UnknownFormat(format.to_string()))
    }
}

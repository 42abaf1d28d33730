//! Per-format storage engine: owns one era-partitioned chunk store, a
//! persisted current era, and the handlers the PDU dispatcher delegates to.
//! The INTEREST/OFFER negotiation heuristics live outside this crate; the
//! handlers here answer with what the store plainly holds.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::codec::{self, ChunkReceivedListener, CodecError};
use crate::era::{Era, DEFAULT_CACHE_LOOKBACK};
use crate::protocol::{encode_frame, FrameEncodeError, Pdu, PduHeader};
use crate::store::{ChunkStorage, StoreError};

/// Marker file holding the engine's format identifier, written on creation
/// so a registry can rehydrate discovered folders.
pub const FORMAT_FILE: &str = "format.id";
/// Marker file holding the engine's current era.
pub const ERA_FILE: &str = "era";

/// Outbound sink a handler writes response frames to. Implemented by the
/// node's connection handle.
pub trait PduSink: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>);
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("folder {0} holds no engine")]
    NotAnEngine(PathBuf),
    #[error("folder {folder} already holds format {found:?}, not {requested:?}")]
    FormatMismatch {
        folder: PathBuf,
        requested: String,
        found: String,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameEncodeError),
}

/// One engine per format. Chunks live under `<folder>/<era>/...`; the era
/// and format markers live directly in `<folder>`.
pub struct Engine {
    owner: String,
    format: String,
    folder: PathBuf,
    storage: ChunkStorage,
    era: Mutex<Era>,
    cache_lookback: u32,
}

impl Engine {
    /// Create or reopen the engine folder for `format`. Writes the format
    /// marker on first creation, restores the persisted era otherwise. A
    /// folder already marked with a different format is rejected rather
    /// than silently reinterpreted.
    pub fn create(owner: &str, format: &str, folder: &Path) -> Result<Engine, EngineError> {
        fs::create_dir_all(folder)?;
        let format_path = folder.join(FORMAT_FILE);
        match fs::read_to_string(&format_path) {
            Ok(existing) => {
                let existing = existing.trim();
                if existing != format {
                    return Err(EngineError::FormatMismatch {
                        folder: folder.to_path_buf(),
                        requested: format.to_string(),
                        found: existing.to_string(),
                    });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::write(&format_path, format)?,
            Err(e) => return Err(e.into()),
        }
        let era = read_era_marker(folder)?;
        Ok(Engine {
            owner: owner.to_string(),
            format: format.to_string(),
            folder: folder.to_path_buf(),
            storage: ChunkStorage::new(folder),
            era: Mutex::new(era),
            cache_lookback: DEFAULT_CACHE_LOOKBACK,
        })
    }

    /// Reopen a discovered engine folder; the format comes from its marker.
    pub fn load(owner: &str, folder: &Path) -> Result<Engine, EngineError> {
        let format_path = folder.join(FORMAT_FILE);
        let format = match fs::read_to_string(&format_path) {
            Ok(s) => s.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::NotAnEngine(folder.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        if format.is_empty() {
            return Err(EngineError::NotAnEngine(folder.to_path_buf()));
        }
        let era = read_era_marker(folder)?;
        Ok(Engine {
            owner: owner.to_string(),
            format,
            folder: folder.to_path_buf(),
            storage: ChunkStorage::new(folder),
            era: Mutex::new(era),
            cache_lookback: DEFAULT_CACHE_LOOKBACK,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Number of past eras a cache lookup walks. Set before the engine is
    /// shared; the registry applies its configured value on construction.
    pub fn set_cache_lookback(&mut self, lookback: u32) {
        self.cache_lookback = lookback;
    }

    pub fn cache_lookback(&self) -> u32 {
        self.cache_lookback
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn era(&self) -> Era {
        *self.era.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn storage(&self) -> &ChunkStorage {
        &self.storage
    }

    /// Advance to the next era and persist the marker.
    pub fn new_era(&self) -> Result<Era, EngineError> {
        let mut era = self.era.lock().unwrap_or_else(|e| e.into_inner());
        *era = era.next();
        fs::write(self.folder.join(ERA_FILE), era.to_string())?;
        Ok(*era)
    }

    /// Producer path: append one message at the current era.
    pub fn add_message(&self, uri: &str, message: &str) -> Result<(), EngineError> {
        let chunk = self.storage.chunk(uri, self.era())?;
        chunk.add_message(message)?;
        Ok(())
    }

    /// Aggregated view of one URI over the lookback window ending at the
    /// current era.
    pub fn chunk_cache(&self, uri: &str) -> Result<crate::store::ChunkCache, EngineError> {
        Ok(self.storage.chunk_cache(uri, self.era(), self.cache_lookback)?)
    }

    /// INTEREST handler: offer every chunk present in the requested era
    /// (current era when the interest names none).
    pub fn handle_interest(
        &self,
        header: &PduHeader,
        out: &dyn PduSink,
    ) -> Result<(), EngineError> {
        let era = header.era.unwrap_or_else(|| self.era());
        for chunk in self.storage.chunks(era)? {
            let offer = Pdu::Offer(PduHeader {
                sender: self.owner.clone(),
                recipient: Some(header.sender.clone()),
                format: self.format.clone(),
                uri: Some(chunk.uri().to_string()),
                era: Some(era),
                signed: false,
            });
            out.send_frame(encode_frame(&offer)?);
        }
        Ok(())
    }

    /// OFFER handler: recorded only; fetching offered chunks is driven by
    /// the negotiation layer above this crate.
    pub fn handle_offer(&self, header: &PduHeader) -> Result<(), EngineError> {
        tracing::debug!(
            format = %self.format,
            sender = %header.sender,
            uri = header.uri.as_deref().unwrap_or(""),
            "offer received"
        );
        Ok(())
    }

    /// ASSIMILATE handler: consume the chunk-codec payload into storage at
    /// the current era, firing the listener per completed chunk.
    pub fn handle_assimilate(
        &self,
        header: &PduHeader,
        payload: &[u8],
        listener: &dyn ChunkReceivedListener,
    ) -> Result<u32, EngineError> {
        let stored = codec::read_chunks(&header.sender, payload, &self.storage, self.era(), listener)?;
        Ok(stored)
    }
}

fn read_era_marker(folder: &Path) -> Result<Era, EngineError> {
    match fs::read_to_string(folder.join(ERA_FILE)) {
        Ok(s) => Ok(s.trim().parse::<Era>().unwrap_or(Era::FIRST)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Era::FIRST),
        Err(e) => Err(e.into()),
    }
}

//! Filesystem chunk store: era-partitioned directories, percent-encoded URI
//! addressing. Layout: `<root>/<era>/<encoded-uri>.msg` plus a `.rcpt` file
//! for the recipient set.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::era::Era;

/// Extension of chunk content files.
pub const DATA_EXTENSION: &str = "msg";
/// Extension of chunk recipient files.
pub const RECIPIENT_EXTENSION: &str = "rcpt";

const LEN_SIZE: usize = 4;

/// Error accessing persisted chunks.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt chunk file {0}")]
    Corrupt(PathBuf),
    #[error("uri {0:?} yields no usable storage key")]
    InvalidUri(String),
}

/// Translate a URI into a filesystem-safe token. Percent-encodes exactly
/// `\ / : ? " < > |`; everything else passes through. Deterministic and
/// one-way: the encoded form is the storage key, it is never decoded.
pub fn uri_to_file_name(uri: &str) -> String {
    let mut out = String::with_capacity(uri.len());
    for c in uri.chars() {
        match c {
            '\\' => out.push_str("%5C"),
            '/' => out.push_str("%2F"),
            ':' => out.push_str("%3A"),
            '?' => out.push_str("%3F"),
            '"' => out.push_str("%22"),
            '<' => out.push_str("%3C"),
            '>' => out.push_str("%3E"),
            '|' => out.push_str("%7C"),
            other => out.push(other),
        }
    }
    out
}

/// Era-partitioned chunk store rooted at one directory.
/// Safe under concurrent appends from multiple connections; a single append
/// lock serializes all writes into this store.
pub struct ChunkStorage {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ChunkStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ChunkStorage {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn era_path(&self, era: Era) -> PathBuf {
        self.root.join(era.to_string())
    }

    /// Handle for the chunk at (uri, era). Existence is not implied; check
    /// [`ChunkStorage::exists_chunk`] or [`Chunk::exists`] separately.
    pub fn chunk(&self, uri: &str, era: Era) -> Result<Chunk, StoreError> {
        let name = uri_to_file_name(uri);
        if name.is_empty() {
            return Err(StoreError::InvalidUri(uri.to_string()));
        }
        let dir = self.era_path(era);
        Ok(Chunk {
            uri: uri.to_string(),
            era,
            content_path: dir.join(format!("{name}.{DATA_EXTENSION}")),
            recipients_path: dir.join(format!("{name}.{RECIPIENT_EXTENSION}")),
            write_lock: self.write_lock.clone(),
        })
    }

    /// True iff persisted content exists for (uri, era).
    pub fn exists_chunk(&self, uri: &str, era: Era) -> bool {
        let name = uri_to_file_name(uri);
        !name.is_empty()
            && self
                .era_path(era)
                .join(format!("{name}.{DATA_EXTENSION}"))
                .exists()
    }

    /// All chunks present in the given era partition. Absent partition is an
    /// empty list, never an error. Enumerated chunks carry their storage key
    /// as URI (the encoding is one-way).
    pub fn chunks(&self, era: Era) -> Result<Vec<Chunk>, StoreError> {
        let dir = self.era_path(era);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{DATA_EXTENSION}")) else {
                continue;
            };
            out.push(Chunk {
                uri: stem.to_string(),
                era,
                content_path: dir.join(name),
                recipients_path: dir.join(format!("{stem}.{RECIPIENT_EXTENSION}")),
                write_lock: self.write_lock.clone(),
            });
        }
        out.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(out)
    }

    /// Irreversibly delete the whole era partition. No-op when absent;
    /// calling it twice leaves no residue either time.
    pub fn drop_era(&self, era: Era) -> Result<(), StoreError> {
        match fs::remove_dir_all(self.era_path(era)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Aggregation view over one URI spanning `lookback` eras back from
    /// `to_era` (inclusive on both ends), for "has this peer already seen
    /// this" queries. `lookback` defaults to
    /// [`crate::era::DEFAULT_CACHE_LOOKBACK`] at call sites.
    pub fn chunk_cache(
        &self,
        uri: &str,
        to_era: Era,
        lookback: u32,
    ) -> Result<ChunkCache, StoreError> {
        let from_era = to_era.lookback_start(lookback);
        let mut messages = Vec::new();
        let mut era = from_era;
        loop {
            if self.exists_chunk(uri, era) {
                messages.extend(self.chunk(uri, era)?.messages()?);
            }
            if era == to_era {
                break;
            }
            era = era.next();
        }
        Ok(ChunkCache {
            uri: uri.to_string(),
            from_era,
            to_era,
            messages,
        })
    }
}

/// One chunk: ordered, append-only messages for (uri, era), plus recipients.
pub struct Chunk {
    uri: String,
    era: Era,
    content_path: PathBuf,
    recipients_path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl Chunk {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn era(&self) -> Era {
        self.era
    }

    pub fn exists(&self) -> bool {
        self.content_path.exists()
    }

    /// Append one message. Creates the era directory lazily; creation is
    /// idempotent. Insertion order is preserved within the era.
    pub fn add_message(&self, message: &str) -> Result<(), StoreError> {
        let guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        append_record(&self.content_path, message)?;
        drop(guard);
        Ok(())
    }

    /// All messages in insertion order; empty when nothing was persisted.
    pub fn messages(&self) -> Result<Vec<String>, StoreError> {
        read_records(&self.content_path)
    }

    pub fn message_count(&self) -> Result<u32, StoreError> {
        Ok(self.messages()?.len() as u32)
    }

    /// Add a recipient; duplicates are kept out.
    pub fn add_recipient(&self, recipient: &str) -> Result<(), StoreError> {
        let guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = read_records(&self.recipients_path)?;
        if !current.iter().any(|r| r == recipient) {
            append_record(&self.recipients_path, recipient)?;
        }
        drop(guard);
        Ok(())
    }

    pub fn recipients(&self) -> Result<Vec<String>, StoreError> {
        read_records(&self.recipients_path)
    }

    pub fn remove_recipient(&self, recipient: &str) -> Result<(), StoreError> {
        let guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let remaining: Vec<String> = read_records(&self.recipients_path)?
            .into_iter()
            .filter(|r| r != recipient)
            .collect();
        rewrite_records(&self.recipients_path, &remaining)?;
        drop(guard);
        Ok(())
    }

    /// Erase this chunk's persisted content and recipients. Missing files
    /// are fine.
    pub fn erase(&self) -> Result<(), StoreError> {
        for path in [&self.content_path, &self.recipients_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// In-memory aggregation of one URI's messages across an era window.
pub struct ChunkCache {
    uri: String,
    from_era: Era,
    to_era: Era,
    messages: Vec<String>,
}

impl ChunkCache {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Window covered, inclusive on both ends.
    pub fn span(&self) -> (Era, Era) {
        (self.from_era, self.to_era)
    }

    /// Messages in era order, insertion order within each era.
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn contains(&self, message: &str) -> bool {
        self.messages.iter().any(|m| m == message)
    }
}

// File record format: u32 LE length prefix followed by UTF-8 bytes, repeated.
// Same shape as one wire text field, so an append is one record written.

fn append_record(path: &Path, text: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let bytes = text.as_bytes();
    file.write_all(&(bytes.len() as u32).to_le_bytes())?;
    file.write_all(bytes)?;
    Ok(())
}

fn rewrite_records(path: &Path, records: &[String]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = Vec::new();
    for r in records {
        buf.extend_from_slice(&(r.len() as u32).to_le_bytes());
        buf.extend_from_slice(r.as_bytes());
    }
    fs::write(path, buf)?;
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<String>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    let mut at = 0usize;
    while at < bytes.len() {
        if at + LEN_SIZE > bytes.len() {
            return Err(StoreError::Corrupt(path.to_path_buf()));
        }
        let len = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
            as usize;
        at += LEN_SIZE;
        if at + len > bytes.len() {
            return Err(StoreError::Corrupt(path.to_path_buf()));
        }
        let text = std::str::from_utf8(&bytes[at..at + len])
            .map_err(|_| StoreError::Corrupt(path.to_path_buf()))?;
        out.push(text.to_string());
        at += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNSAFE: &[char] = &['\\', '/', ':', '?', '"', '<', '>', '|'];

    #[test]
    fn encoding_removes_unsafe_characters() {
        let uri = "pollen://channel/sub?x=1|y<2>\"z\"\\end";
        let encoded = uri_to_file_name(uri);
        for c in UNSAFE {
            assert!(!encoded.contains(*c), "raw {c:?} in {encoded}");
        }
        // deterministic
        assert_eq!(encoded, uri_to_file_name(uri));
    }

    #[test]
    fn encoding_passes_plain_characters_through() {
        assert_eq!(uri_to_file_name("plain-topic_01"), "plain-topic_01");
        assert_eq!(uri_to_file_name("a/b:c"), "a%2Fb%3Ac");
    }

    #[test]
    fn messages_keep_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path());
        let chunk = storage.chunk("pollen://topic", Era::FIRST).unwrap();
        assert!(!chunk.exists());
        chunk.add_message("first").unwrap();
        chunk.add_message("second").unwrap();
        chunk.add_message("third").unwrap();
        assert!(chunk.exists());
        assert_eq!(chunk.messages().unwrap(), ["first", "second", "third"]);
        assert_eq!(chunk.message_count().unwrap(), 3);
        assert!(storage.exists_chunk("pollen://topic", Era::FIRST));
        assert!(!storage.exists_chunk("pollen://topic", Era::FIRST.next()));
    }

    #[test]
    fn eras_are_separate_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path());
        let e0 = Era::new(7);
        storage.chunk("u", e0).unwrap().add_message("old").unwrap();
        storage.chunk("u", e0.next()).unwrap().add_message("new").unwrap();
        assert_eq!(storage.chunk("u", e0).unwrap().messages().unwrap(), ["old"]);
        assert_eq!(
            storage.chunk("u", e0.next()).unwrap().messages().unwrap(),
            ["new"]
        );
    }

    #[test]
    fn chunks_on_missing_partition_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path());
        assert!(storage.chunks(Era::new(99)).unwrap().is_empty());
    }

    #[test]
    fn chunks_enumerates_partition() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path());
        let era = Era::new(3);
        storage.chunk("alpha", era).unwrap().add_message("a").unwrap();
        storage.chunk("beta", era).unwrap().add_message("b").unwrap();
        let names: Vec<String> = storage
            .chunks(era)
            .unwrap()
            .iter()
            .map(|c| c.uri().to_string())
            .collect();
        assert_eq!(names, ["alpha", "beta"]);
    }

    #[test]
    fn drop_era_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path());
        let era = Era::new(5);
        storage.chunk("u", era).unwrap().add_message("m").unwrap();
        storage.drop_era(era).unwrap();
        assert!(!storage.exists_chunk("u", era));
        assert!(storage.chunks(era).unwrap().is_empty());
        // twice in a row, and on an era that never existed
        storage.drop_era(era).unwrap();
        storage.drop_era(Era::new(12345)).unwrap();
    }

    #[test]
    fn empty_uri_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path());
        assert!(matches!(
            storage.chunk("", Era::FIRST),
            Err(StoreError::InvalidUri(_))
        ));
    }

    #[test]
    fn recipients_add_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path());
        let chunk = storage.chunk("u", Era::FIRST).unwrap();
        chunk.add_recipient("alice").unwrap();
        chunk.add_recipient("bob").unwrap();
        chunk.add_recipient("alice").unwrap();
        assert_eq!(chunk.recipients().unwrap(), ["alice", "bob"]);
        chunk.remove_recipient("alice").unwrap();
        assert_eq!(chunk.recipients().unwrap(), ["bob"]);
    }

    #[test]
    fn concurrent_appends_to_same_uri() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(ChunkStorage::new(dir.path()));
        let mut handles = Vec::new();
        for t in 0..4 {
            let storage = storage.clone();
            handles.push(std::thread::spawn(move || {
                let chunk = storage.chunk("shared", Era::FIRST).unwrap();
                for i in 0..25 {
                    chunk.add_message(&format!("t{t}-{i}")).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let chunk = storage.chunk("shared", Era::FIRST).unwrap();
        let messages = chunk.messages().unwrap();
        assert_eq!(messages.len(), 100);
        // per-writer order survives interleaving
        let t0: Vec<&String> = messages.iter().filter(|m| m.starts_with("t0-")).collect();
        let expected: Vec<String> = (0..25).map(|i| format!("t0-{i}")).collect();
        assert_eq!(t0.len(), 25);
        for (got, want) in t0.iter().zip(expected.iter()) {
            assert_eq!(*got, want);
        }
    }

    #[test]
    fn chunk_cache_spans_window() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path());
        let to_era = Era::new(10);
        storage.chunk("u", Era::new(8)).unwrap().add_message("m8").unwrap();
        storage.chunk("u", Era::new(10)).unwrap().add_message("m10").unwrap();
        // outside the window
        storage.chunk("u", Era::new(11)).unwrap().add_message("m11").unwrap();
        let cache = storage.chunk_cache("u", to_era, 5).unwrap();
        assert_eq!(cache.span(), (Era::new(5), to_era));
        assert_eq!(cache.messages(), ["m8", "m10"]);
        assert!(cache.contains("m8"));
        assert!(!cache.contains("m11"));
    }

    #[test]
    fn chunk_cache_window_wraps_around_zero() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path());
        storage.chunk("u", Era::LAST).unwrap().add_message("old").unwrap();
        storage.chunk("u", Era::new(1)).unwrap().add_message("new").unwrap();
        let cache = storage.chunk_cache("u", Era::new(1), 3).unwrap();
        assert_eq!(cache.messages(), ["old", "new"]);
    }
}

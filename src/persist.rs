//! Persistence collaborators and the background writer.
//!
//! The store is saved as one JSON blob under a `(group, key)` pair of a
//! key-value config store, and mirrored to a backup file that is consulted
//! when the primary blob is missing or unreadable.
//!
//! All writes go through a single `PersistenceWriter` thread fed by a
//! bounded channel, so there is never more than one save in flight. Dirty
//! notifications arriving inside the debounce window collapse into one
//! write; an explicit flush writes immediately and reports back through a
//! `FlushTicket`.

use crate::config::PersistenceConfig;
use crate::document::{Document, DocumentError};
use chrono::{DateTime, TimeZone, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    Io(String),
    Document(DocumentError),
    /// No writer is attached
    Disabled,
    QueueFull,
    WriterGone,
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Document(e) => write!(f, "{}", e),
            Self::Disabled => write!(f, "Persistence is disabled"),
            Self::QueueFull => write!(f, "Persistence queue is full"),
            Self::WriterGone => write!(f, "Persistence writer has stopped"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<DocumentError> for PersistError {
    fn from(e: DocumentError) -> Self {
        Self::Document(e)
    }
}

/// Key-value configuration store addressed by `(group, key)`
pub trait ConfigStore: Send + Sync {
    fn get(&self, group: &str, key: &str) -> Result<Option<String>, PersistError>;
    fn set(&self, group: &str, key: &str, value: &str) -> Result<(), PersistError>;
}

/// Secondary copy of the whole serialized document
pub trait BackupSink: Send + Sync {
    fn read(&self) -> Result<Option<String>, PersistError>;
    fn write(&self, content: &str) -> Result<(), PersistError>;
}

/// In-process config store; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    inner: Arc<Mutex<BTreeMap<(String, String), String>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, group: &str, key: &str) -> Result<Option<String>, PersistError> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(&(group.to_string(), key.to_string())).cloned())
    }

    fn set(&self, group: &str, key: &str, value: &str) -> Result<(), PersistError> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert((group.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

/// In-process backup; clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackup {
    inner: Arc<Mutex<Option<String>>>,
}

impl BackupSink for MemoryBackup {
    fn read(&self) -> Result<Option<String>, PersistError> {
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn write(&self, content: &str) -> Result<(), PersistError> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(content.to_string());
        Ok(())
    }
}

/// Config store kept as one JSON file of `{group: {key: value}}`.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

type Groups = BTreeMap<String, BTreeMap<String, String>>;

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_groups(&self) -> Result<Groups, PersistError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(Groups::new()),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                PersistError::Document(DocumentError::Malformed(e.to_string()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Groups::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ConfigStore for FileConfigStore {
    fn get(&self, group: &str, key: &str) -> Result<Option<String>, PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let groups = self.read_groups()?;
        Ok(groups.get(group).and_then(|g| g.get(key)).cloned())
    }

    fn set(&self, group: &str, key: &str, value: &str) -> Result<(), PersistError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        // An unreadable file is replaced rather than blocking every save.
        let mut groups = self.read_groups().unwrap_or_default();
        groups
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        let text = serde_json::to_string_pretty(&groups)
            .map_err(|e| PersistError::Document(DocumentError::SerializationFailed(e.to_string())))?;
        write_atomic(&self.path, &text)
    }
}

/// Backup file written through a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileBackup {
    path: PathBuf,
}

impl FileBackup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackupSink for FileBackup {
    fn read(&self) -> Result<Option<String>, PersistError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, content: &str) -> Result<(), PersistError> {
        write_atomic(&self.path, content)
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<(), PersistError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Where a loaded document came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Backup,
    Empty,
}

/// Load from the primary blob, then the backup, then fall back to empty.
///
/// A document recovered from the backup is copied back into the primary
/// store. Every failure is logged and recovered.
pub fn load_document(
    primary: &dyn ConfigStore,
    backup: Option<&dyn BackupSink>,
    group: &str,
    key: &str,
) -> (Document, LoadSource) {
    match primary.get(group, key) {
        Ok(Some(text)) if !text.trim().is_empty() => match Document::from_json(&text) {
            Ok(doc) => {
                info!(group, key, profiles = doc.profiles.len(), "Loaded document");
                return (doc, LoadSource::Primary);
            }
            Err(e) => warn!(group, key, error = %e, "Primary document unreadable"),
        },
        Ok(_) => debug!(group, key, "No primary document"),
        Err(e) => warn!(group, key, error = %e, "Primary store unavailable"),
    }

    if let Some(backup) = backup {
        match backup.read() {
            Ok(Some(text)) => match Document::from_json(&text) {
                Ok(doc) => {
                    info!(profiles = doc.profiles.len(), "Recovered document from backup");
                    match doc.to_json() {
                        Ok(json) => {
                            if let Err(e) = primary.set(group, key, &json) {
                                warn!(error = %e, "Failed to restore primary from backup");
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to serialize recovered document"),
                    }
                    return (doc, LoadSource::Backup);
                }
                Err(e) => warn!(error = %e, "Backup document unreadable"),
            },
            Ok(None) => debug!("No backup document"),
            Err(e) => warn!(error = %e, "Backup unavailable"),
        }
    }

    info!("Starting with an empty document");
    (Document::default(), LoadSource::Empty)
}

/// Writer statistics
#[derive(Debug, Default)]
pub struct WriterStats {
    pub writes: AtomicU64,
    pub skipped: AtomicU64,
    pub coalesced: AtomicU64,
    pub failures: AtomicU64,
    pub dropped: AtomicU64,
    last_flush_ms: AtomicI64,
}

impl WriterStats {
    fn record_flush(&self, at: DateTime<Utc>) {
        self.last_flush_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_flush(&self) -> Option<DateTime<Utc>> {
        match self.last_flush_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            last_flush: self.last_flush(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriterStatsSnapshot {
    pub writes: u64,
    pub skipped: u64,
    pub coalesced: u64,
    pub failures: u64,
    pub dropped: u64,
    pub last_flush: Option<DateTime<Utc>>,
}

/// Result of one flush
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// False when the content matched the last write
    pub written: bool,
    pub bytes: usize,
    pub digest: u64,
}

type FlushReply = Sender<Result<FlushReport, PersistError>>;

enum WriterMsg {
    Dirty(Document),
    Flush(Document, FlushReply),
    Shutdown,
}

/// Pending flush. Dropping the ticket abandons the wait, not the write.
pub struct FlushTicket {
    rx: Receiver<Result<FlushReport, PersistError>>,
}

impl FlushTicket {
    pub fn wait(self) -> Result<FlushReport, PersistError> {
        self.rx.recv().map_err(|_| PersistError::WriterGone)?
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<FlushReport, PersistError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PersistError::WriterGone)),
        }
    }

    pub fn try_result(&self) -> Option<Result<FlushReport, PersistError>> {
        self.rx.try_recv().ok()
    }
}

pub struct PersistenceWriter {
    tx: Sender<WriterMsg>,
    stats: Arc<WriterStats>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PersistenceWriter {
    pub fn spawn(
        config: &PersistenceConfig,
        primary: Arc<dyn ConfigStore>,
        backup: Option<Arc<dyn BackupSink>>,
    ) -> Result<Self, PersistError> {
        let (tx, rx) = bounded(config.channel_capacity.max(1));
        let stats = Arc::new(WriterStats::default());

        let mut worker = WriterWorker {
            group: config.group.clone(),
            key: config.key.clone(),
            debounce: Duration::from_millis(config.debounce_ms),
            primary,
            backup,
            stats: stats.clone(),
            last_digest: None,
        };

        let handle = thread::Builder::new()
            .name("cadence-persist".into())
            .spawn(move || {
                info!("Persistence writer active.");
                worker.run(rx);
                info!("Persistence writer stopped.");
            })?;

        Ok(Self {
            tx,
            stats,
            handle: Some(handle),
        })
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        self.stats.clone()
    }

    /// Queue a debounced save. Never blocks; a full queue drops the request.
    pub fn mark_dirty(&self, doc: Document) -> bool {
        match self.tx.try_send(WriterMsg::Dirty(doc)) {
            Ok(_) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Queue an immediate save without waiting for it.
    pub fn request_flush(&self, doc: Document) -> Result<FlushTicket, PersistError> {
        let (reply, rx) = bounded(1);
        match self.tx.try_send(WriterMsg::Flush(doc, reply)) {
            Ok(_) => Ok(FlushTicket { rx }),
            Err(TrySendError::Full(_)) => Err(PersistError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(PersistError::WriterGone),
        }
    }

    /// Drain pending work and stop the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(WriterMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Persistence writer panicked");
            }
        }
    }
}

impl Drop for PersistenceWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WriterWorker {
    group: String,
    key: String,
    debounce: Duration,
    primary: Arc<dyn ConfigStore>,
    backup: Option<Arc<dyn BackupSink>>,
    stats: Arc<WriterStats>,
    last_digest: Option<u64>,
}

impl WriterWorker {
    fn run(&mut self, rx: Receiver<WriterMsg>) {
        let mut pending: Option<Document> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let msg = match deadline {
                Some(d) => match rx.recv_deadline(d) {
                    Ok(msg) => Some(msg),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match rx.recv() {
                    Ok(msg) => Some(msg),
                    Err(_) => break,
                },
            };

            match msg {
                None => {
                    deadline = None;
                    if let Some(doc) = pending.take() {
                        self.write_logged(&doc);
                    }
                }
                Some(WriterMsg::Dirty(doc)) => {
                    if pending.replace(doc).is_some() {
                        self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    }
                    deadline.get_or_insert_with(|| Instant::now() + self.debounce);
                }
                Some(WriterMsg::Flush(doc, reply)) => {
                    if pending.take().is_some() {
                        self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    }
                    deadline = None;
                    let result = self.write(&doc);
                    if let Err(e) = &result {
                        warn!(error = %e, "Flush failed");
                    }
                    let _ = reply.send(result);
                }
                Some(WriterMsg::Shutdown) => break,
            }
        }

        if let Some(doc) = pending.take() {
            self.write_logged(&doc);
        }
    }

    fn write_logged(&mut self, doc: &Document) {
        if let Err(e) = self.write(doc) {
            warn!(error = %e, "Debounced save failed");
        }
    }

    fn write(&mut self, doc: &Document) -> Result<FlushReport, PersistError> {
        let json = doc.to_json().inspect_err(|_| {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        })?;
        let digest = xxh3_64(json.as_bytes());

        if self.last_digest == Some(digest) {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(FlushReport {
                written: false,
                bytes: json.len(),
                digest,
            });
        }

        if let Err(e) = self.primary.set(&self.group, &self.key, &json) {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        if let Some(backup) = &self.backup {
            if let Err(e) = backup.write(&json) {
                warn!(error = %e, "Backup write failed");
            }
        }

        self.last_digest = Some(digest);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.record_flush(Utc::now());
        debug!(bytes = json.len(), digest, "Saved document");

        Ok(FlushReport {
            written: true,
            bytes: json.len(),
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::EntityKey;
    use crate::profile::EntityProfile;

    const GROUP: &str = "attackcycle";
    const KEY: &str = "db_v2";

    fn doc_with(name: &str) -> Document {
        let key = EntityKey::of(name, 100);
        let mut doc = Document::default();
        doc.profiles.insert(key.key.clone(), EntityProfile::new(&key));
        doc
    }

    fn config() -> PersistenceConfig {
        PersistenceConfig {
            debounce_ms: 10_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_load_prefers_primary() {
        let primary = MemoryConfigStore::new();
        let backup = MemoryBackup::default();
        primary.set(GROUP, KEY, &doc_with("Primary").to_json().unwrap()).unwrap();
        backup.write(&doc_with("Backup").to_json().unwrap()).unwrap();

        let (doc, source) = load_document(&primary, Some(&backup as &dyn BackupSink), GROUP, KEY);
        assert_eq!(source, LoadSource::Primary);
        assert!(doc.profiles.contains_key("primary#100"));
    }

    #[test]
    fn test_corrupt_primary_falls_back_to_backup_and_restores() {
        let primary = MemoryConfigStore::new();
        let backup = MemoryBackup::default();
        primary.set(GROUP, KEY, "{not json").unwrap();
        backup.write(&doc_with("Backup").to_json().unwrap()).unwrap();

        let (doc, source) = load_document(&primary, Some(&backup as &dyn BackupSink), GROUP, KEY);
        assert_eq!(source, LoadSource::Backup);
        assert!(doc.profiles.contains_key("backup#100"));

        let restored = primary.get(GROUP, KEY).unwrap().unwrap();
        assert!(Document::from_json(&restored).is_ok());
    }

    #[test]
    fn test_nothing_readable_gives_empty() {
        let primary = MemoryConfigStore::new();
        let backup = MemoryBackup::default();
        backup.write("garbage").unwrap();

        let (doc, source) = load_document(&primary, Some(&backup as &dyn BackupSink), GROUP, KEY);
        assert_eq!(source, LoadSource::Empty);
        assert!(doc.is_empty());
    }

    #[test]
    fn test_file_collaborators() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("settings.json"));
        assert_eq!(store.get(GROUP, KEY).unwrap(), None);
        store.set(GROUP, KEY, "{}").unwrap();
        store.set("other", "x", "1").unwrap();

        let reopened = FileConfigStore::new(dir.path().join("settings.json"));
        assert_eq!(reopened.get(GROUP, KEY).unwrap().as_deref(), Some("{}"));

        let backup = FileBackup::new(dir.path().join("nested/attack-cycle-db-v2.json"));
        assert_eq!(backup.read().unwrap(), None);
        backup.write("{\"version\":2}").unwrap();
        assert_eq!(backup.read().unwrap().as_deref(), Some("{\"version\":2}"));
        assert!(!dir.path().join("nested/attack-cycle-db-v2.json.tmp").exists());
    }

    #[test]
    fn test_writer_coalesces_and_flushes() {
        let primary = MemoryConfigStore::new();
        let backup = MemoryBackup::default();
        let writer = PersistenceWriter::spawn(
            &config(),
            Arc::new(primary.clone()),
            Some(Arc::new(backup.clone())),
        )
        .unwrap();

        for name in ["a", "b", "c", "d"] {
            assert!(writer.mark_dirty(doc_with(name)));
        }
        let report = writer.request_flush(doc_with("final")).unwrap().wait().unwrap();
        assert!(report.written);

        let stats = writer.stats().snapshot();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.coalesced, 4);
        assert!(stats.last_flush.is_some());

        let saved = Document::from_json(&primary.get(GROUP, KEY).unwrap().unwrap()).unwrap();
        assert!(saved.profiles.contains_key("final#100"));
        assert_eq!(backup.read().unwrap(), primary.get(GROUP, KEY).unwrap());
    }

    #[test]
    fn test_unchanged_content_skipped() {
        let primary = MemoryConfigStore::new();
        let writer = PersistenceWriter::spawn(&config(), Arc::new(primary), None).unwrap();

        let first = writer.request_flush(doc_with("same")).unwrap().wait().unwrap();
        let second = writer.request_flush(doc_with("same")).unwrap().wait().unwrap();
        assert!(first.written);
        assert!(!second.written);
        assert_eq!(first.digest, second.digest);
        assert_eq!(writer.stats().snapshot().skipped, 1);
    }

    #[test]
    fn test_shutdown_drains_pending() {
        let primary = MemoryConfigStore::new();
        let writer = PersistenceWriter::spawn(&config(), Arc::new(primary.clone()), None).unwrap();
        writer.mark_dirty(doc_with("late"));
        writer.shutdown();

        let saved = Document::from_json(&primary.get(GROUP, KEY).unwrap().unwrap()).unwrap();
        assert!(saved.profiles.contains_key("late#100"));
    }

    #[test]
    fn test_dropped_ticket_does_not_cancel_write() {
        let primary = MemoryConfigStore::new();
        let writer = PersistenceWriter::spawn(&config(), Arc::new(primary.clone()), None).unwrap();
        drop(writer.request_flush(doc_with("fire")).unwrap());
        writer.shutdown();
        assert!(primary.get(GROUP, KEY).unwrap().is_some());
    }
}

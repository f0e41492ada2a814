//! Durable cache of projected events, partitioned by owner.
//!
//! Writes happen inside a [`CacheTxn`]: staged work becomes visible only on
//! `commit`, and a transaction dropped before `commit` leaves no trace.

use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::{
    error::StorageError,
    event::Event,
    projection::ReplaceableKey,
    router::Taxonomy,
};

/// Owner partition used when no identity is configured.
pub const PUBLIC_OWNER: &str = "public";

/// Persistence backend for projected events.
pub trait DurableCache: Send + Sync {
    /// Every event stored for `owner`, oldest first.
    fn load(&self, owner: &str) -> Result<Vec<Event>, StorageError>;

    /// Open a write transaction for `owner`.
    fn begin<'a>(&'a self, owner: &str) -> Result<Box<dyn CacheTxn + 'a>, StorageError>;

    /// Store one event in its own transaction.
    fn persist(&self, owner: &str, event: &Event) -> Result<(), StorageError> {
        let mut txn = self.begin(owner)?;
        txn.put(event)?;
        txn.commit()
    }
}

/// Unit of work against a [`DurableCache`]. Dropping without `commit` rolls back.
///
/// `commit` applies the staged events in order and each one lands atomically.
/// If it fails part way, events before the failure stay written; committing
/// the same events again completes the batch without duplicating anything.
pub trait CacheTxn {
    fn put(&mut self, event: &Event) -> Result<(), StorageError>;
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Path component safe for any owner or `d` tag value.
fn path_segment(raw: &str) -> String {
    let safe = !raw.is_empty()
        && !raw.starts_with('.')
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        raw.to_string()
    } else {
        format!("~{}", hex::encode(raw))
    }
}

/// File-backed cache rooted at `root`:
///
/// ```text
/// <root>/<owner>/events/ab/cd/<id>.json
/// <root>/<owner>/log/events.ndjson
/// <root>/<owner>/latest/<pubkey>.<kind>.<identifier>
/// ```
#[derive(Clone)]
pub struct FileCache {
    root: PathBuf,
    taxonomy: Taxonomy,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            taxonomy: Taxonomy::default(),
        }
    }

    /// Use `taxonomy` to decide which events supersede each other on disk.
    pub fn with_taxonomy(mut self, taxonomy: Taxonomy) -> Self {
        self.taxonomy = taxonomy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, owner: &str) -> PathBuf {
        self.root.join(path_segment(owner))
    }

    fn event_path(owner_dir: &Path, id: &str) -> PathBuf {
        let (a, b) = (id.get(0..2).unwrap_or("__"), id.get(2..4).unwrap_or("__"));
        owner_dir
            .join("events")
            .join(a)
            .join(b)
            .join(format!("{id}.json"))
    }

    fn latest_path(owner_dir: &Path, key: &ReplaceableKey) -> PathBuf {
        owner_dir.join("latest").join(format!(
            "{}.{}.{}",
            path_segment(&key.pubkey),
            key.kind,
            if key.identifier.is_empty() {
                String::new()
            } else {
                path_segment(&key.identifier)
            }
        ))
    }
}

impl DurableCache for FileCache {
    fn load(&self, owner: &str) -> Result<Vec<Event>, StorageError> {
        let events_dir = self.owner_dir(owner).join("events");
        if !events_dir.exists() {
            return Ok(vec![]);
        }
        let mut events = vec![];
        for entry in walkdir::WalkDir::new(&events_dir) {
            let entry = entry?;
            if !entry.file_type().is_file()
                || entry.path().extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            let data = fs::read_to_string(entry.path())?;
            let ev: Event = match serde_json::from_str(&data) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping unreadable cache entry");
                    continue;
                }
            };
            if let Err(e) = ev.verify() {
                warn!(id = %ev.id, error = %e, "skipping cached event that fails verification");
                continue;
            }
            events.push(ev);
        }
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    fn begin<'a>(&'a self, owner: &str) -> Result<Box<dyn CacheTxn + 'a>, StorageError> {
        let owner_dir = self.owner_dir(owner);
        fs::create_dir_all(owner_dir.join("events"))?;
        fs::create_dir_all(owner_dir.join("log"))?;
        fs::create_dir_all(owner_dir.join("latest"))?;
        Ok(Box::new(FileTxn {
            cache: self,
            owner_dir,
            staged: vec![],
            committed: false,
        }))
    }
}

struct Staged {
    tmp: NamedTempFile,
    path: PathBuf,
    event: Event,
}

struct FileTxn<'a> {
    cache: &'a FileCache,
    owner_dir: PathBuf,
    staged: Vec<Staged>,
    committed: bool,
}

impl FileTxn<'_> {
    /// Apply one staged write. Returns false when a newer event already holds
    /// the replaceable slot and the write was skipped.
    fn apply(&self, staged: Staged) -> Result<bool, StorageError> {
        let Staged { tmp, path, event } = staged;
        let key = self.cache.taxonomy.key_for(&event);
        let mut superseded = None;
        if let Some(key) = &key {
            let latest = FileCache::latest_path(&self.owner_dir, key);
            if let Ok(current_id) = fs::read_to_string(&latest) {
                let current_id = current_id.trim();
                let current_path = FileCache::event_path(&self.owner_dir, current_id);
                if current_id != event.id {
                    match fs::read_to_string(&current_path)
                        .ok()
                        .and_then(|d| serde_json::from_str::<Event>(&d).ok())
                    {
                        Some(current) if current.created_at >= event.created_at => {
                            debug!(id = %event.id, current = %current.id, "cache already holds a newer event");
                            return Ok(false);
                        }
                        Some(_) => superseded = Some(current_path),
                        None => {}
                    }
                }
            }
        }

        if !path.exists() {
            tmp.persist(&path)?;
            let mut log_file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.owner_dir.join("log/events.ndjson"))?;
            serde_json::to_writer(&mut log_file, &event)?;
            log_file.write_all(b"\n")?;
        }

        if let Some(key) = &key {
            let latest = FileCache::latest_path(&self.owner_dir, key);
            let mut pointer = NamedTempFile::new_in(self.owner_dir.join("latest"))?;
            pointer.write_all(event.id.as_bytes())?;
            pointer.persist(latest)?;
        }
        if let Some(old) = superseded {
            if let Err(e) = fs::remove_file(&old) {
                warn!(path = %old.display(), error = %e, "failed to remove superseded event");
            }
        }
        Ok(true)
    }
}

impl CacheTxn for FileTxn<'_> {
    fn put(&mut self, event: &Event) -> Result<(), StorageError> {
        let path = FileCache::event_path(&self.owner_dir, &event.id);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.owner_dir.clone());
        fs::create_dir_all(&parent)?;
        let tmp = NamedTempFile::new_in(&parent)?;
        serde_json::to_writer(&tmp, event)?;
        tmp.as_file().sync_all()?;
        self.staged.push(Staged {
            tmp,
            path,
            event: event.clone(),
        });
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        for staged in std::mem::take(&mut self.staged) {
            let id = staged.event.id.clone();
            if self.apply(staged)? {
                debug!(%id, "cache write committed");
            }
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for FileTxn<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.staged.is_empty() {
            debug!(count = self.staged.len(), "rolling back cache transaction");
        }
    }
}

/// In-memory cache. Useful in tests and for sessions that must not touch disk.
#[derive(Default)]
pub struct MemoryCache {
    owners: Mutex<HashMap<String, HashMap<String, Event>>>,
    taxonomy: Taxonomy,
    failures: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with an I/O error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of events stored for `owner`.
    pub fn len(&self, owner: &str) -> usize {
        self.owners.lock().get(owner).map_or(0, HashMap::len)
    }

    pub fn contains(&self, owner: &str, id: &str) -> bool {
        self.owners
            .lock()
            .get(owner)
            .is_some_and(|m| m.contains_key(id))
    }
}

impl DurableCache for MemoryCache {
    fn load(&self, owner: &str) -> Result<Vec<Event>, StorageError> {
        let mut events: Vec<_> = self
            .owners
            .lock()
            .get(owner)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    fn begin<'a>(&'a self, owner: &str) -> Result<Box<dyn CacheTxn + 'a>, StorageError> {
        Ok(Box::new(MemoryTxn {
            cache: self,
            owner: owner.to_string(),
            staged: vec![],
        }))
    }
}

struct MemoryTxn<'a> {
    cache: &'a MemoryCache,
    owner: String,
    staged: Vec<Event>,
}

impl CacheTxn for MemoryTxn<'_> {
    fn put(&mut self, event: &Event) -> Result<(), StorageError> {
        self.staged.push(event.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTxn {
            cache,
            owner,
            staged,
        } = *self;
        let failing = cache
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected failure",
            )));
        }
        let mut owners = cache.owners.lock();
        let stored = owners.entry(owner).or_default();
        for event in staged {
            if let Some(key) = cache.taxonomy.key_for(&event) {
                let current = stored
                    .values()
                    .find(|e| cache.taxonomy.key_for(e).as_ref() == Some(&key))
                    .map(|e| (e.id.clone(), e.created_at));
                match current {
                    Some((_, ts)) if ts >= event.created_at => continue,
                    Some((id, _)) => {
                        stored.remove(&id);
                    }
                    None => {}
                }
            }
            stored.insert(event.id.clone(), event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::signed;
    use tempfile::TempDir;

    #[test]
    fn persist_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path());
        let a = signed(1, 1, None, 2, "second");
        let b = signed(1, 1, None, 1, "first");
        cache.persist("owner", &a).unwrap();
        cache.persist("owner", &b).unwrap();
        // idempotent
        cache.persist("owner", &a).unwrap();

        assert_eq!(cache.load("owner").unwrap(), vec![b, a.clone()]);
        assert!(cache.load("someone-else").unwrap().is_empty());

        let path = dir
            .path()
            .join("owner/events")
            .join(&a.id[0..2])
            .join(&a.id[2..4])
            .join(format!("{}.json", a.id));
        assert!(path.exists());
        let log = fs::read_to_string(dir.path().join("owner/log/events.ndjson")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn superseded_replaceable_is_removed() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path());
        let older = signed(1, 31002, Some("world-1"), 90, r#"{"title":"old"}"#);
        let newer = signed(1, 31002, Some("world-1"), 100, r#"{"title":"new"}"#);
        cache.persist("o", &older).unwrap();
        cache.persist("o", &newer).unwrap();
        assert_eq!(cache.load("o").unwrap(), vec![newer.clone()]);

        let pointer = dir
            .path()
            .join(format!("o/latest/{}.31002.world-1", newer.pubkey));
        assert_eq!(fs::read_to_string(pointer).unwrap(), newer.id);
    }

    #[test]
    fn older_replaceable_does_not_overwrite_newer() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path());
        let older = signed(1, 0, None, 90, r#"{"name":"old"}"#);
        let newer = signed(1, 0, None, 100, r#"{"name":"new"}"#);
        cache.persist("o", &newer).unwrap();
        cache.persist("o", &older).unwrap();
        assert_eq!(cache.load("o").unwrap(), vec![newer]);
    }

    #[test]
    fn dropped_transaction_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path());
        let ev = signed(1, 1, None, 1, "never committed");
        {
            let mut txn = cache.begin("o").unwrap();
            txn.put(&ev).unwrap();
        }
        assert!(cache.load("o").unwrap().is_empty());
        let leftovers = walkdir::WalkDir::new(dir.path().join("o/events"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn load_skips_tampered_entries() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path());
        let ev = signed(1, 1, None, 1, "original");
        cache.persist("o", &ev).unwrap();
        let mut tampered = ev.clone();
        tampered.content = "edited".into();
        let path = FileCache::event_path(&dir.path().join("o"), &ev.id);
        fs::write(&path, serde_json::to_string(&tampered).unwrap()).unwrap();
        fs::write(path.with_file_name("junk.json"), "{not json").unwrap();
        assert!(cache.load("o").unwrap().is_empty());
    }

    #[test]
    fn odd_identifiers_are_encoded() {
        assert_eq!(path_segment("world-1"), "world-1");
        assert_eq!(path_segment("a/b"), format!("~{}", hex::encode("a/b")));
        assert_eq!(path_segment(".."), format!("~{}", hex::encode("..")));
        assert_eq!(path_segment(""), "~");
    }

    #[test]
    fn memory_cache_converges_and_fails_on_demand() {
        let cache = MemoryCache::new();
        let older = signed(1, 31003, Some("p"), 1, "{}");
        let newer = signed(1, 31003, Some("p"), 2, "{}");
        cache.persist("o", &newer).unwrap();
        cache.persist("o", &older).unwrap();
        assert_eq!(cache.load("o").unwrap(), vec![newer.clone()]);

        cache.fail_next(1);
        let note = signed(1, 1, None, 3, "n");
        assert!(matches!(cache.persist("o", &note), Err(StorageError::Io(_))));
        assert!(!cache.contains("o", &note.id));
        cache.persist("o", &note).unwrap();
        assert_eq!(cache.len("o"), 2);
    }

    #[test]
    fn failed_commit_keeps_earlier_events_and_retry_completes() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path());
        let note = signed(1, 1, None, 1, "first");
        let profile = signed(1, 0, None, 2, r#"{"name":"p"}"#);
        // a directory where the profile's latest pointer goes makes its rename fail
        let pointer = dir.path().join(format!("o/latest/{}.0.", profile.pubkey));
        fs::create_dir_all(pointer.join("blocker")).unwrap();

        let batch = |cache: &FileCache| -> Result<(), StorageError> {
            let mut txn = cache.begin("o")?;
            txn.put(&note)?;
            txn.put(&profile)?;
            txn.commit()
        };
        assert!(matches!(batch(&cache), Err(StorageError::Persist(_))));
        assert!(cache.load("o").unwrap().contains(&note));

        fs::remove_dir_all(&pointer).unwrap();
        batch(&cache).unwrap();
        assert_eq!(cache.load("o").unwrap(), vec![note, profile.clone()]);
        assert_eq!(fs::read_to_string(&pointer).unwrap(), profile.id);
        let log = fs::read_to_string(dir.path().join("o/log/events.ndjson")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn custom_taxonomy_decides_what_supersedes() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path())
            .with_taxonomy(Taxonomy::nip01().with(0, crate::router::KindClass::Regular));
        let older = signed(1, 0, None, 1, r#"{"name":"a"}"#);
        let newer = signed(1, 0, None, 2, r#"{"name":"b"}"#);
        cache.persist("o", &older).unwrap();
        cache.persist("o", &newer).unwrap();
        assert_eq!(cache.load("o").unwrap(), vec![older, newer]);
    }
}

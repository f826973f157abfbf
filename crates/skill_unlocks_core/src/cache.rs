use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::SkillDataMap;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);
pub const DEFAULT_MIN_WRITE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheSnapshot {
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub skill_data: SkillDataMap,
}

#[derive(Serialize)]
struct CacheSnapshotRef<'a> {
    last_updated: DateTime<Utc>,
    skill_data: &'a SkillDataMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Outcome of a non-blocking advisory lock attempt. The lock is held for as
/// long as the `Locked` file handle lives.
#[derive(Debug)]
pub enum LockAttempt {
    Locked(File),
    Unavailable,
}

pub fn try_lock(lock_path: &Path, mode: LockMode) -> LockAttempt {
    let file = match OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
    {
        Ok(file) => file,
        Err(error) => {
            debug!(path = %lock_path.display(), error = %error, "cannot open cache lock file");
            return LockAttempt::Unavailable;
        }
    };

    let result = match mode {
        LockMode::Shared => file.try_lock_shared(),
        LockMode::Exclusive => file.try_lock(),
    };
    match result {
        Ok(()) => LockAttempt::Locked(file),
        Err(error) => {
            debug!(path = %lock_path.display(), error = %error, "cache lock not acquired");
            LockAttempt::Unavailable
        }
    }
}

/// On-disk location of the snapshot plus its sidecar lock file.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_os_string();
        lock_name.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_name),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn lock(&self, mode: LockMode) -> Option<File> {
        match try_lock(&self.lock_path, mode) {
            LockAttempt::Locked(file) => Some(file),
            LockAttempt::Unavailable => {
                warn!(
                    path = %self.path.display(),
                    ?mode,
                    "cache lock unavailable; continuing without it"
                );
                None
            }
        }
    }

    /// Replaces the cache file with a fresh snapshot of `skill_data`.
    pub fn write(&self, skill_data: &SkillDataMap) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("cache path has no parent: {}", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let _guard = self.lock(LockMode::Exclusive);

        let snapshot = CacheSnapshotRef {
            last_updated: Utc::now(),
            skill_data,
        };
        let rendered =
            serde_json::to_string_pretty(&snapshot).context("failed to serialize cache snapshot")?;

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cache".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", process::id()));
        fs::write(&temp_path, rendered)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        if let Err(error) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(error)
                .with_context(|| format!("failed to replace {}", self.path.display()));
        }

        debug!(path = %self.path.display(), skills = skill_data.len(), "cache written");
        Ok(())
    }

    pub fn read(&self) -> Result<Option<CacheSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let _guard = self.lock(LockMode::Shared);
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let snapshot: CacheSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    /// Like [`CacheStore::read`] but never fails: anything unusable is an empty map.
    pub fn load(&self) -> SkillDataMap {
        match self.read() {
            Ok(Some(snapshot)) => snapshot.skill_data,
            Ok(None) => SkillDataMap::new(),
            Err(error) => {
                warn!(error = %format!("{error:#}"), "ignoring unreadable cache");
                SkillDataMap::new()
            }
        }
    }

    pub fn is_expired(&self, ttl_hours: u32) -> bool {
        let modified = match fs::metadata(&self.path).and_then(|metadata| metadata.modified()) {
            Ok(modified) => modified,
            Err(_) => return true,
        };
        let ttl = Duration::from_secs(u64::from(ttl_hours) * 3600);
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age > ttl,
            // mtime in the future
            Err(_) => false,
        }
    }

    /// Deletes the cache file. Returns `true` when a file was removed.
    pub fn remove(&self) -> Result<bool> {
        let _guard = self
            .path
            .parent()
            .filter(|parent| parent.exists())
            .and_then(|_| self.lock(LockMode::Exclusive));
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => {
                Err(error).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteThrottle {
    pub debounce: Duration,
    pub min_interval: Duration,
}

impl Default for WriteThrottle {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            min_interval: DEFAULT_MIN_WRITE_INTERVAL,
        }
    }
}

impl WriteThrottle {
    /// Delay before a newly saved snapshot is written.
    pub fn delay(&self, since_last_write: Option<Duration>) -> Duration {
        let interval_wait = since_last_write
            .map(|since| self.min_interval.saturating_sub(since))
            .unwrap_or(Duration::ZERO);
        self.debounce.max(interval_wait)
    }
}

enum WriterCommand {
    Save(SkillDataMap),
    Cancel(Sender<()>),
    Flush(Sender<()>),
    Shutdown,
}

struct WriterHandle {
    sender: Sender<WriterCommand>,
    thread: JoinHandle<()>,
}

struct WriterState {
    store: Arc<CacheStore>,
    throttle: WriteThrottle,
    pending: Option<SkillDataMap>,
    deadline: Option<Instant>,
    last_write: Option<Instant>,
}

impl WriterState {
    fn write_pending(&mut self) {
        self.deadline = None;
        let Some(skill_data) = self.pending.take() else {
            return;
        };
        match self.store.write(&skill_data) {
            Ok(()) => self.last_write = Some(Instant::now()),
            Err(error) => warn!(error = %format!("{error:#}"), "failed to write cache"),
        }
    }

    fn run(mut self, commands: Receiver<WriterCommand>) {
        loop {
            let command = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        self.write_pending();
                        continue;
                    }
                    match commands.recv_timeout(deadline - now) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Timeout) => {
                            self.write_pending();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => WriterCommand::Shutdown,
                    }
                }
                None => commands.recv().unwrap_or(WriterCommand::Shutdown),
            };

            match command {
                WriterCommand::Save(skill_data) => {
                    self.pending = Some(skill_data);
                    let delay = self
                        .throttle
                        .delay(self.last_write.map(|written| written.elapsed()));
                    self.deadline = Some(Instant::now() + delay);
                }
                WriterCommand::Cancel(ack) => {
                    self.pending = None;
                    self.deadline = None;
                    let _ = ack.send(());
                }
                WriterCommand::Flush(ack) => {
                    self.write_pending();
                    let _ = ack.send(());
                }
                WriterCommand::Shutdown => {
                    self.write_pending();
                    break;
                }
            }
        }
    }
}

/// Cache facade with debounced background writes.
///
/// `save` hands the snapshot to a writer thread that coalesces bursts;
/// `flush`, `shutdown` and dropping the cache force any pending snapshot out.
pub struct SkillCache {
    store: Arc<CacheStore>,
    writer: Mutex<Option<WriterHandle>>,
}

impl SkillCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_throttle(path, WriteThrottle::default())
    }

    pub fn with_throttle(path: impl Into<PathBuf>, throttle: WriteThrottle) -> Self {
        let store = Arc::new(CacheStore::new(path));
        let (sender, receiver) = mpsc::channel();
        let state = WriterState {
            store: Arc::clone(&store),
            throttle,
            pending: None,
            deadline: None,
            last_write: None,
        };
        let writer = match thread::Builder::new()
            .name("skill-cache-writer".to_string())
            .spawn(move || state.run(receiver))
        {
            Ok(thread) => Some(WriterHandle { sender, thread }),
            Err(error) => {
                warn!(error = %error, "failed to start cache writer; saves will be synchronous");
                None
            }
        };

        Self {
            store,
            writer: Mutex::new(writer),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Returns the command back when no writer thread accepted it.
    fn send(&self, command: WriterCommand) -> Option<WriterCommand> {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match writer.as_ref() {
            Some(handle) => handle.sender.send(command).err().map(|error| error.0),
            None => Some(command),
        }
    }

    fn round_trip(&self, make: impl FnOnce(Sender<()>) -> WriterCommand) {
        let (ack, done) = mpsc::channel();
        if self.send(make(ack)).is_none() {
            done.recv().ok();
        }
    }

    pub fn save(&self, skill_data: SkillDataMap) {
        if let Some(WriterCommand::Save(skill_data)) = self.send(WriterCommand::Save(skill_data))
            && let Err(error) = self.store.write(&skill_data)
        {
            warn!(error = %format!("{error:#}"), "failed to write cache");
        }
    }

    /// Writes immediately, discarding any snapshot still waiting on the debounce.
    pub fn save_now(&self, skill_data: &SkillDataMap) -> Result<()> {
        self.round_trip(WriterCommand::Cancel);
        self.store.write(skill_data)
    }

    pub fn load(&self) -> SkillDataMap {
        self.store.load()
    }

    pub fn is_expired(&self, ttl_hours: u32) -> bool {
        self.store.is_expired(ttl_hours)
    }

    /// Drops any pending write and deletes the cache file. Idempotent.
    pub fn clear(&self) -> Result<bool> {
        self.round_trip(WriterCommand::Cancel);
        self.store.remove()
    }

    pub fn flush(&self) {
        self.round_trip(WriterCommand::Flush);
    }

    pub fn shutdown(&self) {
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        let _ = handle.sender.send(WriterCommand::Shutdown);
        if handle.thread.join().is_err() {
            warn!("cache writer thread panicked");
        }
    }
}

impl Drop for SkillCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Skill, SkillData, Unlock, UnlockCategory};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn sample(name: &str) -> SkillDataMap {
        let parsed_at = Utc
            .timestamp_opt(1_714_564_800, 0)
            .single()
            .expect("valid timestamp");
        let mut data = SkillData::new(Skill::Mining, parsed_at);
        data.add_unlock(Unlock {
            level: 15,
            name: name.to_string(),
            description: String::new(),
            requirements: String::new(),
            category: UnlockCategory::Item,
        });
        SkillDataMap::from([(Skill::Mining, data)])
    }

    fn quick() -> WriteThrottle {
        WriteThrottle {
            debounce: Duration::from_millis(150),
            min_interval: Duration::ZERO,
        }
    }

    fn slow() -> WriteThrottle {
        WriteThrottle {
            debounce: Duration::from_secs(60),
            min_interval: Duration::ZERO,
        }
    }

    #[test]
    fn store_round_trips_snapshot() {
        let temp = tempdir().expect("tempdir");
        let store = CacheStore::new(temp.path().join("nested").join("cache.json"));
        let data = sample("Mine iron");

        store.write(&data).expect("write");
        let snapshot = store.read().expect("read").expect("snapshot present");
        assert_eq!(snapshot.skill_data, data);
        assert_eq!(store.load(), data);

        let raw = fs::read_to_string(store.path()).expect("raw cache");
        assert!(raw.contains("\"last_updated\""));
        assert!(raw.contains("\"mining\""));
    }

    #[test]
    fn load_is_empty_for_missing_or_corrupt_file() {
        let temp = tempdir().expect("tempdir");
        let store = CacheStore::new(temp.path().join("cache.json"));
        assert!(store.load().is_empty());

        fs::write(store.path(), "{ not json").expect("write garbage");
        assert!(store.load().is_empty());
        assert!(store.read().is_err());
    }

    #[test]
    fn expiry_follows_file_mtime() {
        let temp = tempdir().expect("tempdir");
        let store = CacheStore::new(temp.path().join("cache.json"));
        assert!(store.is_expired(24));

        store.write(&sample("Mine iron")).expect("write");
        assert!(!store.is_expired(24));

        let file = File::options()
            .write(true)
            .open(store.path())
            .expect("open cache");
        file.set_modified(SystemTime::now() - Duration::from_secs(48 * 3600))
            .expect("set mtime");
        assert!(store.is_expired(24));
        assert!(!store.is_expired(72));

        file.set_modified(SystemTime::now() + Duration::from_secs(3600))
            .expect("set mtime");
        assert!(!store.is_expired(0));
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let store = CacheStore::new(temp.path().join("cache.json"));
        store.write(&sample("Mine iron")).expect("write");
        assert!(store.remove().expect("remove"));
        assert!(!store.remove().expect("remove again"));
        assert!(!store.path().exists());
    }

    #[test]
    fn write_falls_through_when_lock_is_held() {
        let temp = tempdir().expect("tempdir");
        let store = CacheStore::new(temp.path().join("cache.json"));
        let held = try_lock(store.lock_path(), LockMode::Exclusive);
        assert!(matches!(held, LockAttempt::Locked(_)));
        assert!(matches!(
            try_lock(store.lock_path(), LockMode::Shared),
            LockAttempt::Unavailable
        ));

        let data = sample("Mine iron");
        store.write(&data).expect("write without lock");
        assert_eq!(store.load(), data);
        drop(held);
    }

    #[test]
    fn throttle_delay_respects_min_interval() {
        let throttle = WriteThrottle::default();
        assert_eq!(throttle.delay(None), Duration::from_secs(5));
        assert_eq!(
            throttle.delay(Some(Duration::from_secs(2))),
            Duration::from_secs(8)
        );
        assert_eq!(
            throttle.delay(Some(Duration::from_secs(30))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn save_is_debounced_and_keeps_latest_snapshot() {
        let temp = tempdir().expect("tempdir");
        let cache = SkillCache::with_throttle(temp.path().join("cache.json"), quick());

        cache.save(sample("first"));
        cache.save(sample("second"));
        assert!(!cache.path().exists());

        thread::sleep(Duration::from_millis(600));
        assert_eq!(cache.load(), sample("second"));
    }

    #[test]
    fn shutdown_flushes_pending_snapshot() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("cache.json");
        let cache = SkillCache::with_throttle(&path, slow());
        cache.save(sample("pending"));
        cache.shutdown();
        assert_eq!(CacheStore::new(&path).load(), sample("pending"));

        // after shutdown saves go straight to disk
        cache.save(sample("direct"));
        assert_eq!(cache.load(), sample("direct"));
    }

    #[test]
    fn drop_flushes_pending_snapshot() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("cache.json");
        {
            let cache = SkillCache::with_throttle(&path, slow());
            cache.save(sample("pending"));
        }
        assert_eq!(CacheStore::new(&path).load(), sample("pending"));
    }

    #[test]
    fn clear_cancels_pending_write() {
        let temp = tempdir().expect("tempdir");
        let cache = SkillCache::with_throttle(temp.path().join("cache.json"), slow());
        cache.save(sample("pending"));
        assert!(!cache.clear().expect("clear"));
        cache.flush();
        assert!(!cache.path().exists());
    }

    #[test]
    fn save_now_replaces_pending_snapshot() {
        let temp = tempdir().expect("tempdir");
        let cache = SkillCache::with_throttle(temp.path().join("cache.json"), slow());
        cache.save(sample("stale"));
        cache.save_now(&sample("fresh")).expect("save now");
        cache.shutdown();
        assert_eq!(cache.load(), sample("fresh"));
    }
}

//! File-backed webhook queue.
//!
//! Each pending payload is one `<key>.json` file in the queue directory.
//! Keys are fixed-width so a directory listing sorted by name is processing
//! order. Writes land in a dot-prefixed temp file first and are renamed into
//! place, so readers never observe a partial item.

use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use freem_core::queue::{key_for_id, Enqueued, Queue, QueueError, QueueItem, KEY_WIDTH};
use freem_core::types::WebhookPayload;

const ITEM_EXT: &str = "json";
const ATTEMPTS_EXT: &str = "attempts";
const REASON_EXT: &str = "reason";
const ENQUEUE_LOCK: &str = ".enqueue.lock";
const DRAIN_LOCK: &str = ".drain.lock";
const DEAD_DIR: &str = "dead";

pub struct FileQueue {
    root: PathBuf,
    dead: PathBuf,
    last_fallback: AtomicU64,
}

/// Exclusive drain lease. The OS lock is released when the file closes.
pub struct DrainLease {
    _file: File,
}

impl FileQueue {
    /// Opens (creating if needed) a queue rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, QueueError> {
        let root = root.as_ref().to_path_buf();
        let dead = root.join(DEAD_DIR);
        fs::create_dir_all(&dead).map_err(|e| QueueError::io(&dead, e))?;
        Ok(Self {
            root,
            dead,
            last_fallback: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dead_dir(&self) -> &Path {
        &self.dead
    }

    /// Keys of dead-lettered items, oldest first.
    pub fn dead_letters(&self) -> Result<Vec<String>, QueueError> {
        list_keys(&self.dead)
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{ITEM_EXT}"))
    }

    fn attempts_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{ATTEMPTS_EXT}"))
    }

    fn open_lock(&self, name: &str) -> Result<(File, PathBuf), QueueError> {
        let path = self.root.join(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| QueueError::io(&path, e))?;
        Ok((file, path))
    }

    /// Nanoseconds since the epoch, bumped past the last key handed out so
    /// two payloads in the same tick still get distinct ordered keys.
    fn fallback_key(&self) -> String {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .and_then(|nanos| u64::try_from(nanos).ok())
            .unwrap_or_default();
        let mut last = self.last_fallback.load(Ordering::SeqCst);
        loop {
            let next = now.max(last.saturating_add(1));
            match self.last_fallback.compare_exchange(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return format!("{next:0width$}", width = KEY_WIDTH),
                Err(actual) => last = actual,
            }
        }
    }

    fn read_attempts(&self, key: &str) -> Result<u32, QueueError> {
        let path = self.attempts_path(key);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(raw.trim().parse().unwrap_or_else(|_| {
                warn!(path = %path.display(), "unreadable attempt counter, resetting");
                0
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(QueueError::io(&path, e)),
        }
    }
}

/// Writes `bytes` to a hidden temp file in `dir`, syncs it and renames it to
/// `target`.
fn publish(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), QueueError> {
    let tmp = dir.join(format!(".tmp-{}", nanoid::nanoid!()));
    let written = File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(QueueError::io(&tmp, e));
    }
    fs::rename(&tmp, target).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        QueueError::io(target, e)
    })
}

fn remove_if_present(path: &Path) -> Result<(), QueueError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(QueueError::io(path, e)),
    }
}

/// Sorted item keys in `dir`. Hidden files (locks, temp files) are skipped.
fn list_keys(dir: &Path) -> Result<Vec<String>, QueueError> {
    let entries = fs::read_dir(dir).map_err(|e| QueueError::io(dir, e))?;
    let mut keys = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| QueueError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if let Some(key) = name.strip_suffix(".json") {
            keys.push(key.to_string());
        }
    }
    keys.sort();
    Ok(keys)
}

fn lock_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == ErrorKind::WouldBlock
}

impl Queue for FileQueue {
    type Lease = DrainLease;

    fn enqueue(&self, raw: &[u8]) -> Result<Enqueued, QueueError> {
        let payload = WebhookPayload::from_slice(raw)?;
        let numeric = payload.event_id().as_deref().and_then(key_for_id);

        let (lock, lock_path) = self.open_lock(ENQUEUE_LOCK)?;
        lock.lock_exclusive()
            .map_err(|e| QueueError::io(&lock_path, e))?;

        let key = match numeric {
            Some(key) => {
                if self.item_path(&key).exists() {
                    debug!(%key, "duplicate delivery of a pending event");
                    return Ok(Enqueued::Duplicate(key));
                }
                key
            }
            None => self.fallback_key(),
        };

        publish(&self.root, &self.item_path(&key), raw)?;
        debug!(%key, bytes = raw.len(), "payload enqueued");
        Ok(Enqueued::Stored(key))
    }

    fn peek_oldest(&self) -> Result<Option<QueueItem>, QueueError> {
        for key in list_keys(&self.root)? {
            let path = self.item_path(&key);
            let payload = match fs::read(&path) {
                Ok(payload) => payload,
                // Removed between listing and reading.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(QueueError::io(&path, e)),
            };
            let attempts = self.read_attempts(&key)?;
            return Ok(Some(QueueItem {
                key,
                payload,
                attempts,
            }));
        }
        Ok(None)
    }

    fn remove(&self, item: &QueueItem) -> Result<(), QueueError> {
        remove_if_present(&self.item_path(&item.key))?;
        remove_if_present(&self.attempts_path(&item.key))
    }

    fn record_failure(&self, item: &QueueItem) -> Result<u32, QueueError> {
        let attempts = self.read_attempts(&item.key)?.max(item.attempts) + 1;
        publish(
            &self.root,
            &self.attempts_path(&item.key),
            attempts.to_string().as_bytes(),
        )?;
        Ok(attempts)
    }

    fn dead_letter(&self, item: &QueueItem, reason: &str) -> Result<(), QueueError> {
        let target = self.dead.join(format!("{}.{ITEM_EXT}", item.key));
        publish(
            &self.dead,
            &self.dead.join(format!("{}.{REASON_EXT}", item.key)),
            reason.as_bytes(),
        )?;
        let source = self.item_path(&item.key);
        match fs::rename(&source, &target) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(key = %item.key, "dead-lettered item already gone");
            }
            Err(e) => return Err(QueueError::io(&source, e)),
        }
        remove_if_present(&self.attempts_path(&item.key))
    }

    fn try_lease(&self) -> Result<Option<DrainLease>, QueueError> {
        let (file, path) = self.open_lock(DRAIN_LOCK)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(DrainLease { _file: file })),
            Err(e) if lock_contended(&e) => Ok(None),
            Err(e) => Err(QueueError::io(&path, e)),
        }
    }

    fn pending(&self) -> Result<usize, QueueError> {
        Ok(list_keys(&self.root)?.len())
    }
}

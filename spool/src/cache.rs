//! On-disk spool of batches waiting for delivery.
//!
//! One JSON file per batch, `batch-{sequence_id:020}.{status}.json`. The
//! status lives in the file name so a status change is a single rename.
//! Every write goes through a temp file that is synced and renamed, followed
//! by a sync of the directory.

use crate::error::CacheError;
use pattoo_agent_collector::Batch;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fs::{
        self,
        File,
    },
    io::Write as _,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};
use strum::{
    Display,
    EnumString,
};

const SEQUENCE_FILE: &str = "sequence";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    #[strum(serialize = "inflight")]
    InFlight,
}

/// A batch owned by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub sequence_id: u64,
    pub status: EntryStatus,
    pub batch: Batch,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    sequence_id: u64,
    batch: Batch,
}

#[derive(Debug)]
struct Inner {
    dir: PathBuf,
    next_sequence: u64,
}

/// Durable FIFO of unacknowledged batches for one agent.
///
/// All methods block on file I/O. From async code go through
/// [`LocalCache::blocking`].
#[derive(Debug, Clone)]
pub struct LocalCache {
    inner: Arc<Mutex<Inner>>,
}

impl LocalCache {
    /// Opens (or creates) the cache directory and recovers from a crash:
    /// temp files are removed and in-flight entries become pending again.
    #[instrument(level = "debug", skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(CacheError::io(&dir))?;

        let mut highest = read_high_water(&dir)?;
        let mut reverted = 0;
        for item in fs::read_dir(&dir).map_err(CacheError::io(&dir))? {
            let path = item.map_err(CacheError::io(&dir))?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            if name.ends_with(TEMP_SUFFIX) {
                debug!(file = name, "removing interrupted write");
                fs::remove_file(&path).map_err(CacheError::io(&path))?;
                continue;
            }

            let Some((sequence_id, status)) = parse_file_name(name) else {
                continue;
            };
            highest = highest.max(sequence_id);
            if status == EntryStatus::InFlight {
                let target = dir.join(file_name(sequence_id, EntryStatus::Pending));
                fs::rename(&path, &target).map_err(CacheError::io(&path))?;
                reverted += 1;
            }
        }
        sync_dir(&dir)?;

        if reverted > 0 {
            info!(reverted, "in-flight batches from an earlier run will be sent again");
        }
        debug!(next_sequence = highest + 1, "cache opened");

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                dir,
                next_sequence: highest + 1,
            })),
        })
    }

    /// Runs cache operations on the blocking pool. The closure runs to
    /// completion even if the returned future is dropped.
    pub async fn blocking<T, F>(&self, operation: F) -> Result<T, CacheError>
    where
        F: FnOnce(&LocalCache) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || operation(&cache)).await?
    }

    /// Assigns the next sequence id and persists the batch before returning.
    pub fn enqueue(&self, batch: Batch) -> Result<CacheEntry, CacheError> {
        let mut inner = self.lock();
        let sequence_id = inner.next_sequence;
        let stored = StoredEntry { sequence_id, batch };
        let bytes = serde_json::to_vec(&stored).map_err(|source| CacheError::Encode { sequence_id, source })?;

        write_atomically(&inner.dir, &file_name(sequence_id, EntryStatus::Pending), &bytes)?;
        write_atomically(&inner.dir, SEQUENCE_FILE, sequence_id.to_string().as_bytes())?;
        inner.next_sequence = sequence_id + 1;

        debug!(sequence_id, points = stored.batch.points.len(), "batch cached");
        Ok(CacheEntry {
            sequence_id,
            status: EntryStatus::Pending,
            batch: stored.batch,
        })
    }

    /// Every unacknowledged entry, oldest first.
    pub fn pending(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let inner = self.lock();
        let mut entries = Vec::new();
        for (sequence_id, status) in list_entries(&inner.dir)? {
            if let Some(entry) = read_entry(&inner.dir, sequence_id, status)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// The entry with the lowest sequence id.
    pub fn peek_oldest(&self) -> Result<Option<CacheEntry>, CacheError> {
        let inner = self.lock();
        for (sequence_id, status) in list_entries(&inner.dir)? {
            if let Some(entry) = read_entry(&inner.dir, sequence_id, status)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        let inner = self.lock();
        Ok(list_entries(&inner.dir)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Removes a delivered entry. Returns whether this call removed it.
    pub fn acknowledge(&self, entry: &CacheEntry) -> Result<bool, CacheError> {
        let inner = self.lock();
        let mut removed = false;
        for status in [EntryStatus::InFlight, EntryStatus::Pending] {
            let path = inner.dir.join(file_name(entry.sequence_id, status));
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(CacheError::io(&path)(err)),
            }
        }
        if removed {
            sync_dir(&inner.dir)?;
            trace!(sequence_id = entry.sequence_id, "batch acknowledged");
        }
        Ok(removed)
    }

    pub fn mark_in_flight(&self, entry: &mut CacheEntry) -> Result<(), CacheError> {
        self.set_status(entry, EntryStatus::InFlight)
    }

    pub fn mark_pending(&self, entry: &mut CacheEntry) -> Result<(), CacheError> {
        self.set_status(entry, EntryStatus::Pending)
    }

    fn set_status(&self, entry: &mut CacheEntry, status: EntryStatus) -> Result<(), CacheError> {
        let inner = self.lock();
        let from = inner.dir.join(file_name(entry.sequence_id, entry.status));
        let to = inner.dir.join(file_name(entry.sequence_id, status));
        if from != to {
            match fs::rename(&from, &to) {
                Ok(()) => sync_dir(&inner.dir)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(CacheError::NotFound(entry.sequence_id))
                }
                Err(err) => return Err(CacheError::io(&from)(err)),
            }
        }
        entry.status = status;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-

fn file_name(sequence_id: u64, status: EntryStatus) -> String {
    format!("batch-{sequence_id:020}.{status}.json")
}

fn parse_file_name(name: &str) -> Option<(u64, EntryStatus)> {
    let rest = name.strip_prefix("batch-")?.strip_suffix(".json")?;
    let (sequence_id, status) = rest.split_once('.')?;
    Some((sequence_id.parse().ok()?, status.parse().ok()?))
}

/// Entries currently on disk, ordered by sequence id.
fn list_entries(dir: &Path) -> Result<Vec<(u64, EntryStatus)>, CacheError> {
    let mut entries = fs::read_dir(dir)
        .map_err(CacheError::io(dir))?
        .filter_map(|item| item.ok())
        .filter_map(|item| item.file_name().to_str().and_then(parse_file_name))
        .collect::<Vec<_>>();
    entries.sort_by_key(|(sequence_id, _)| *sequence_id);
    Ok(entries)
}

/// Reads one entry. Unreadable entries are renamed to `.corrupt` and skipped
/// so they cannot block the queue.
fn read_entry(dir: &Path, sequence_id: u64, status: EntryStatus) -> Result<Option<CacheEntry>, CacheError> {
    let path = dir.join(file_name(sequence_id, status));
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        // acknowledged concurrently
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(CacheError::io(&path)(err)),
    };

    match serde_json::from_slice::<StoredEntry>(&bytes) {
        Ok(stored) => Ok(Some(CacheEntry {
            sequence_id,
            status,
            batch: stored.batch,
        })),
        Err(err) => {
            error!(file = %path.display(), %err, "unreadable cache entry, setting it aside");
            let aside = path.with_extension("corrupt");
            fs::rename(&path, &aside).map_err(CacheError::io(&path))?;
            Ok(None)
        }
    }
}

fn read_high_water(dir: &Path) -> Result<u64, CacheError> {
    let path = dir.join(SEQUENCE_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => match content.trim().parse() {
            Ok(sequence_id) => Ok(sequence_id),
            Err(_) => {
                warn!(file = %path.display(), "ignoring unreadable sequence file");
                Ok(0)
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(CacheError::io(&path)(err)),
    }
}

fn write_atomically(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
    let temp = dir.join(format!("{name}{TEMP_SUFFIX}"));
    let target = dir.join(name);

    let mut file = File::create(&temp).map_err(CacheError::io(&temp))?;
    file.write_all(bytes).map_err(CacheError::io(&temp))?;
    file.sync_all().map_err(CacheError::io(&temp))?;
    drop(file);

    fs::rename(&temp, &target).map_err(CacheError::io(&target))?;
    sync_dir(dir)
}

fn sync_dir(dir: &Path) -> Result<(), CacheError> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(CacheError::io(dir))
}

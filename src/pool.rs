//! Build-id-keyed pool of open object files.
//!
//! The pool deduplicates entries by build-id, bounds descriptor pressure
//! through access-time expiration, and owns exactly one reference per cached
//! entry. Eviction releases the pool's reference only; outstanding external
//! clones keep the entry usable until they are released in turn.

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use linked_hash_map::LinkedHashMap;
use log::{debug, error, warn};

use crate::buildid::{self, BuildIdError};
use crate::domain::{BuildId, PoolError};
use crate::elf::ElfMetadata;
use crate::object_file::ObjectFile;
use crate::rc::Reference;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

struct CacheEntry {
    reference: Reference<ObjectFile>,
    last_access: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of the pool's cache counters, for the embedding agent's metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// A pool of open object files, deduplicated by build-id.
///
/// The pool is a first-class value; multiple pools may coexist. All
/// operations serialize briefly on an internal lock, which also makes the
/// get-or-insert decision atomic with respect to concurrent opens of the
/// same binary.
pub struct Pool {
    entries: Mutex<LinkedHashMap<BuildId, CacheEntry>>,
    access_expiry: Duration,
    counters: Counters,
}

impl Pool {
    /// Create a pool whose entries are evicted after `access_expiry` without
    /// access. Typically a small multiple of the profiling interval.
    #[must_use]
    pub fn new(access_expiry: Duration) -> Self {
        Self {
            entries: Mutex::new(LinkedHashMap::new()),
            access_expiry,
            counters: Counters::default(),
        }
    }

    /// Open the executable or library at `path` and return a reference to
    /// its pooled entry.
    ///
    /// The reference must be released after use; the descriptor is closed
    /// when the last outstanding reference is released.
    ///
    /// # Errors
    /// See [`Pool::new_file`], plus I/O errors from opening the path.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Reference<ObjectFile>, PoolError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        self.new_file(file, path)
    }

    /// Build a pooled entry from an already-open descriptor.
    ///
    /// `path` is where the descriptor was opened from; it is kept for
    /// diagnostics and for reopening a prematurely closed entry. If an entry
    /// with the same build-id is already cached, the supplied descriptor is
    /// closed and the cached entry is shared instead.
    ///
    /// # Errors
    /// [`PoolError::UnrecognizedFormat`] for non-ELF input,
    /// [`PoolError::MalformedElf`] for an ELF without sections,
    /// [`PoolError::Released`] if the cached reference can no longer be
    /// cloned. On every error path the supplied descriptor is closed.
    pub fn new_file(
        &self,
        file: File,
        path: impl AsRef<Path>,
    ) -> Result<Reference<ObjectFile>, PoolError> {
        let path = path.as_ref();

        let mut magic = [0_u8; 4];
        match file.read_exact_at(&mut magic, 0) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(PoolError::UnrecognizedFormat(path.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        }
        if magic != ELF_MAGIC {
            return Err(PoolError::UnrecognizedFormat(path.to_path_buf()));
        }

        let elf = ElfMetadata::parse(&file)
            .map_err(|source| PoolError::Parse { path: path.to_path_buf(), source })?;
        if elf.sections().is_empty() {
            return Err(PoolError::MalformedElf(path.to_path_buf()));
        }

        let build_id = match buildid::build_id(&elf) {
            Ok(id) => id,
            Err(BuildIdError::Missing) => {
                warn!("{} has no build id, caching under the empty key", path.display());
                BuildId::default()
            }
        };

        // Parsing moved the shared cursor; hand the descriptor over rewound.
        rewind(&file)?;

        let mut entries = self.lock_entries();
        self.evict_expired_locked(&mut entries);

        if let Some(entry) = entries.get_refresh(&build_id) {
            // Already cached: close the descriptor we just opened and share
            // the existing entry.
            entry.last_access = Instant::now();
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!("cache hit for {} ({build_id})", path.display());
            drop(file);
            return entry
                .reference
                .try_clone()
                .map_err(|source| PoolError::Released { build_id: build_id.clone(), source });
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!("cache miss for {} ({build_id})", path.display());

        let stat = file.metadata()?;
        let modtime = stat.modified()?;
        let object_file = ObjectFile::new(
            build_id.clone(),
            path.to_path_buf(),
            file,
            Arc::new(elf),
            stat.len(),
            modtime,
        );
        let reference = Reference::new(object_file, |entry| Ok(entry.close()?));
        let caller = reference
            .try_clone()
            .map_err(|source| PoolError::Released { build_id: build_id.clone(), source })?;
        entries.insert(build_id, CacheEntry { reference, last_access: Instant::now() });
        Ok(caller)
    }

    /// Clone the cached reference for `build_id`.
    ///
    /// # Errors
    /// [`PoolError::NotFound`] when no entry exists;
    /// [`PoolError::Released`] when the entry can no longer be cloned.
    pub fn get(&self, build_id: &BuildId) -> Result<Reference<ObjectFile>, PoolError> {
        let mut entries = self.lock_entries();
        self.evict_expired_locked(&mut entries);

        match entries.get_refresh(build_id) {
            Some(entry) => {
                entry.last_access = Instant::now();
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                entry
                    .reference
                    .try_clone()
                    .map_err(|source| PoolError::Released { build_id: build_id.clone(), source })
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::NotFound(build_id.clone()))
            }
        }
    }

    /// Evict every entry whose last access is older than the expiry.
    ///
    /// All pool operations sweep as they run; this entry point is for the
    /// embedding agent's periodic tick.
    pub fn evict_expired(&self) {
        let mut entries = self.lock_entries();
        self.evict_expired_locked(&mut entries);
    }

    /// Release every pooled reference and empty the cache. Entries with
    /// outstanding external clones stay alive until those are released.
    /// Idempotent; also invoked on drop.
    pub fn close(&self) {
        let mut entries = self.lock_entries();
        if entries.is_empty() {
            return;
        }
        debug!("closing pool with {} entries", entries.len());
        while let Some((build_id, entry)) = entries.pop_front() {
            Self::release_entry(&build_id, &entry);
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired_locked(&self, entries: &mut LinkedHashMap<BuildId, CacheEntry>) {
        // get_refresh keeps the map in access order, so the stale entries
        // are at the front.
        loop {
            let expired = match entries.front() {
                Some((_, entry)) => entry.last_access.elapsed() >= self.access_expiry,
                None => false,
            };
            if !expired {
                break;
            }
            if let Some((build_id, entry)) = entries.pop_front() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("evicting {build_id} after access expiry");
                Self::release_entry(&build_id, &entry);
            }
        }
    }

    /// Removal callback: give up the pool's own reference. The destructor
    /// only fires if no external clones remain. Failures are logged; they
    /// must not disturb unrelated pool operations.
    fn release_entry(build_id: &BuildId, entry: &CacheEntry) {
        if let Err(err) = entry.reference.release() {
            error!("failed to release pooled reference for {build_id}: {err}");
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, LinkedHashMap<BuildId, CacheEntry>> {
        self.entries.lock().expect("pool entries lock poisoned")
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
    }
}

fn rewind(file: &File) -> io::Result<()> {
    let mut file = file;
    file.seek(SeekFrom::Start(0))?;
    Ok(())
}

//! Cached object-file entries and their descriptor lifecycle.
//!
//! An [`ObjectFile`] owns one ELF binary's OS descriptor together with its
//! parsed view. Cursor-based reads are serialized through a [`Reader`]
//! guard; positional reads ([`ObjectFile::read_at`],
//! [`ObjectFile::section_data`]) go straight to the descriptor and run in
//! parallel with each other and with an exclusive reader. A descriptor the
//! pool closed early is transparently reopened on the next access and closed
//! again when that access ends, so eviction never severs ongoing work.

use std::backtrace::Backtrace;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use anyhow::Context;
use log::{debug, warn};

use crate::domain::{BuildId, ObjectFileError};
use crate::elf::{ElfMetadata, ElfSection};
use crate::rc::Reference;

/// Descriptive metadata of a cached object file.
///
/// A snapshot: size and modtime are re-stat'ed when a closed entry is
/// reopened, so they can move between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub build_id: BuildId,
    pub path: PathBuf,
    pub size: u64,
    pub modtime: SystemTime,
}

struct FileState {
    /// `None` once the descriptor has been closed. Shared so in-flight
    /// positional reads keep the descriptor alive across a close.
    file: Option<Arc<File>>,
    elf: Arc<ElfMetadata>,
    size: u64,
    modtime: SystemTime,
    closed: bool,
    /// Stack trace captured at the first close, reported on a double close.
    closed_by: Option<Backtrace>,
}

/// An executable or library file owned by the pool.
///
/// Jointly owned by the pool's cached reference and every cloned external
/// reference; destroyed exactly once, by the reference destructor, when the
/// last handle is released.
pub struct ObjectFile {
    build_id: BuildId,
    path: PathBuf,
    /// Serializes cursor-based readers. Positional reads never take it.
    reader_lock: Mutex<()>,
    state: Mutex<FileState>,
    debug_file: Mutex<Option<Reference<ObjectFile>>>,
}

impl ObjectFile {
    pub(crate) fn new(
        build_id: BuildId,
        path: PathBuf,
        file: File,
        elf: Arc<ElfMetadata>,
        size: u64,
        modtime: SystemTime,
    ) -> Self {
        Self {
            build_id,
            path,
            reader_lock: Mutex::new(()),
            state: Mutex::new(FileState {
                file: Some(Arc::new(file)),
                elf,
                size,
                modtime,
                closed: false,
                closed_by: None,
            }),
            debug_file: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current metadata snapshot.
    #[must_use]
    pub fn info(&self) -> Info {
        let state = self.lock_state();
        Info {
            build_id: self.build_id.clone(),
            path: self.path.clone(),
            size: state.size,
            modtime: state.modtime,
        }
    }

    /// Acquire exclusive access to the file's shared cursor.
    ///
    /// Readers are serialized: the next `reader` call blocks until the
    /// returned guard is dropped. Positional reads are not affected. If the
    /// descriptor was closed early, the acquisition reopens it and dropping
    /// the guard restores the closed state. The cursor is at offset 0 on
    /// acquisition and rewound again on drop.
    ///
    /// # Errors
    /// [`ObjectFileError::Reopen`] when a closed entry cannot be reopened.
    pub fn reader(&self) -> Result<Reader<'_>, ObjectFileError> {
        let exclusive = self.reader_lock.lock().expect("reader lock poisoned");

        let mut state = self.lock_state();
        let mut reopened = false;
        if state.closed {
            self.reopen(&mut state)?;
            reopened = true;
        }
        let file = match state.file.as_ref() {
            None => return Err(ObjectFileError::NotInitialized),
            Some(file) => Arc::clone(file),
        };
        drop(state);

        let mut cursor: &File = &file;
        if let Err(err) = cursor.seek(SeekFrom::Start(0)) {
            if reopened {
                Self::reclose(&mut self.lock_state());
            }
            return Err(err.into());
        }

        Ok(Reader { entry: self, _exclusive: exclusive, file, reopened })
    }

    /// Positional read of the file contents.
    ///
    /// Does not touch the shared cursor and does not serialize against an
    /// exclusive reader; the entry lock is held only long enough to grab the
    /// descriptor. A closed entry is transiently reopened and left closed.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ObjectFileError> {
        Ok(self.shared_file()?.read_at(buf, offset)?)
    }

    /// Positional exact read; see [`ObjectFile::read_at`].
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<(), ObjectFileError> {
        Ok(self.shared_file()?.read_exact_at(buf, offset)?)
    }

    /// Contents of `section`, read positionally. Sections that occupy no
    /// file space (`.bss`-like) yield an empty buffer.
    pub fn section_data(&self, section: &ElfSection) -> Result<Vec<u8>, ObjectFileError> {
        let Some((offset, size)) = section.file_range else {
            return Ok(Vec::new());
        };
        let mut data = vec![0_u8; size as usize];
        self.read_exact_at(&mut data, offset)?;
        Ok(data)
    }

    /// Parsed view of the image.
    ///
    /// The snapshot is owned, so consumers may keep it while others read
    /// through the descriptor. If the entry is currently closed, the view is
    /// refreshed through a transient reopen that leaves the entry closed.
    pub fn elf(&self) -> Result<Arc<ElfMetadata>, ObjectFileError> {
        let mut state = self.lock_state();
        if !state.closed {
            return Ok(Arc::clone(&state.elf));
        }

        self.reopen(&mut state)?;
        let elf = Arc::clone(&state.elf);
        Self::reclose(&mut state);
        Ok(elf)
    }

    /// Whether the image carries a `.text` section.
    #[must_use]
    pub fn has_text_section(&self) -> bool {
        match self.elf() {
            Ok(elf) => elf.has_section(".text"),
            Err(err) => {
                warn!("failed to inspect {}: {err}", self.path.display());
                false
            }
        }
    }

    /// Associate the separately cached debug-info file for this binary. The
    /// reference is released together with this entry. A debug entry must
    /// never reference its owning entry.
    pub fn set_debug_file(&self, debug_file: Reference<ObjectFile>) {
        let mut slot = self.lock_debug_file();
        if let Some(previous) = slot.replace(debug_file) {
            if let Err(err) = previous.release() {
                warn!("failed to release replaced debug file reference: {err}");
            }
        }
    }

    /// Clone the associated debug-file reference, if one is set and alive.
    #[must_use]
    pub fn debug_file(&self) -> Option<Reference<ObjectFile>> {
        self.lock_debug_file().as_ref().and_then(|reference| reference.try_clone().ok())
    }

    /// Tear the entry down: close the descriptor and release the associated
    /// debug-file reference. Called by the reference destructor when the
    /// last handle is released.
    ///
    /// # Errors
    /// [`ObjectFileError::AlreadyClosed`] on a second close, carrying the
    /// stack trace of the first.
    pub(crate) fn close(&self) -> Result<(), ObjectFileError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(ObjectFileError::AlreadyClosed {
                path: self.path.clone(),
                closed_by: state
                    .closed_by
                    .as_ref()
                    .map(|site| site.to_string())
                    .unwrap_or_else(|| "<unknown>".to_string()),
            });
        }
        Self::reclose(&mut state);
        drop(state);

        if let Some(debug_file) = self.lock_debug_file().take() {
            if let Err(err) = debug_file.release() {
                warn!("failed to release debug file for {}: {err}", self.path.display());
            }
        }
        Ok(())
    }

    /// Clone the shared descriptor for a positional read, transiently
    /// reopening a closed entry. The clone keeps the descriptor readable for
    /// the duration of the read even if the entry is closed meanwhile.
    fn shared_file(&self) -> Result<Arc<File>, ObjectFileError> {
        let mut state = self.lock_state();
        if let Some(file) = state.file.as_ref() {
            return Ok(Arc::clone(file));
        }
        if !state.closed {
            return Err(ObjectFileError::NotInitialized);
        }

        self.reopen(&mut state)?;
        let file = match state.file.as_ref() {
            None => return Err(ObjectFileError::NotInitialized),
            Some(file) => Arc::clone(file),
        };
        Self::reclose(&mut state);
        Ok(file)
    }

    /// Reopen a prematurely closed descriptor from the entry's path.
    ///
    /// In normal use the pool hands out open entries; this recovers the case
    /// where the descriptor was closed while consumers still hold
    /// references.
    fn reopen(&self, state: &mut FileState) -> Result<(), ObjectFileError> {
        match open_and_parse(&self.path) {
            Ok((file, elf, size, modtime)) => {
                if size != state.size || modtime != state.modtime {
                    debug!("{} changed on disk while closed", self.path.display());
                }
                state.file = Some(Arc::new(file));
                state.elf = Arc::new(elf);
                state.size = size;
                state.modtime = modtime;
                state.closed = false;
                Ok(())
            }
            Err(source) => Err(ObjectFileError::Reopen { path: self.path.clone(), source }),
        }
    }

    /// Drop the descriptor and record the logically-closed state.
    fn reclose(state: &mut FileState) {
        state.file = None;
        state.closed = true;
        state.closed_by = Some(Backtrace::capture());
    }

    fn lock_state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().expect("object file state lock poisoned")
    }

    fn lock_debug_file(&self) -> MutexGuard<'_, Option<Reference<ObjectFile>>> {
        self.debug_file.lock().expect("debug file lock poisoned")
    }
}

fn open_and_parse(path: &Path) -> anyhow::Result<(File, ElfMetadata, u64, SystemTime)> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let elf = ElfMetadata::parse(&file).context("failed to parse ELF image")?;
    let stat = file.metadata().context("failed to stat file")?;
    let modtime = stat.modified().context("failed to read mtime")?;
    Ok((file, elf, stat.len(), modtime))
}

/// Exclusive reader over an entry's shared cursor.
///
/// Supports sequential [`Read`]/[`Seek`] plus positional reads. Dropping the
/// guard rewinds the cursor, restores the closed state if the acquisition
/// had to reopen, and lets the next reader in.
pub struct Reader<'a> {
    entry: &'a ObjectFile,
    _exclusive: MutexGuard<'a, ()>,
    file: Arc<File>,
    reopened: bool,
}

impl Reader<'_> {
    /// Positional read; does not move the shared cursor.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    /// Positional exact read; does not move the shared cursor.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }
}

impl Read for Reader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut file: &File = &self.file;
        file.read(buf)
    }
}

impl Seek for Reader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut file: &File = &self.file;
        file.seek(pos)
    }
}

impl Drop for Reader<'_> {
    fn drop(&mut self) {
        // Leave the cursor at 0 for the next reader.
        let mut cursor: &File = &self.file;
        if let Err(err) = cursor.seek(SeekFrom::Start(0)) {
            warn!("failed to rewind {} after read: {err}", self.entry.path.display());
        }
        if self.reopened {
            ObjectFile::reclose(&mut self.entry.lock_state());
        }
    }
}

//! Purpose: File-backed rings with a persistent state header.
//! Exports: `FileRing`, `FileRingOptions`, `SyncMode`, `FileStorage`,
//! `FileHeader`.
//! Role: Maps ring storage onto a locked file whose first bytes hold the
//! encoded state, and implements the media-level reshapes (reopen with a
//! larger capacity, shrink to a compacted copy).
//! Invariants: The header is written after the bytes it describes, so a
//! crash between the two under-reports rather than invents content. The
//! file lock is exclusive per ring file across processes.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt as _;
use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::notify::Wait;
use crate::core::reader::Reader;
use crate::core::ring::{validate_capacity, Ring, RingInfo};
use crate::core::state::RingState;
use crate::core::storage::Storage;
use crate::core::writer::Writer;

/// State slots at the front of every ring file: head offset, size,
/// capacity, each a little-endian u64.
const STATE_SLOTS: usize = 3;
const SLOT_BYTES: usize = 8;
const COPY_CHUNK: usize = 8 * 1024;

/// Durability policy for the backing file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SyncMode {
    /// Leave flushing to the operating system.
    #[default]
    None,
    /// Open the file with `O_DSYNC`: every write reaches the device
    /// before it returns.
    Sync,
    /// Issue `fdatasync` after each header publish.
    Force,
}

/// Construction options for a file-backed ring.
#[derive(Clone, Copy, Debug)]
pub struct FileRingOptions {
    /// Initial capacity in bytes, rounded up to a power of two. An
    /// existing file keeps its stored capacity unless this is larger.
    pub capacity: usize,
    /// Hard ceiling on growth; 0 means unbounded.
    pub limit: usize,
    /// Policy when a write needs more space than the limit allows.
    pub write_wait: Wait,
    /// Policy for blocking reads on an empty ring.
    pub read_wait: Wait,
    pub sync: SyncMode,
    /// Chunk size consumers should use when draining this ring.
    pub reader_buffer: usize,
    /// Chunk size producers should use when feeding this ring.
    pub writer_buffer: usize,
    /// Header slots reserved past the ring state for a layering protocol.
    /// Must match the value the file was created with.
    pub extra_header_slots: usize,
}

impl Default for FileRingOptions {
    fn default() -> Self {
        Self {
            capacity: 128 * 1024,
            limit: 5 * 1024 * 1024,
            write_wait: Wait::Never,
            read_wait: Wait::Forever,
            sync: SyncMode::None,
            reader_buffer: 8 * 1024,
            writer_buffer: 4 * 1024,
            extra_header_slots: 0,
        }
    }
}

/// Decoded ring file header, readable without taking the file lock.
#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    pub head_offset: usize,
    pub size: usize,
    pub capacity: usize,
    pub wrapped: bool,
    pub file_len: u64,
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn open_error(path: &Path, err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    };
    Error::new(kind)
        .with_message("cannot open ring file")
        .with_path(path)
        .with_source(err)
}

fn lock_error(path: &Path, err: io::Error) -> Error {
    let kind = match err.raw_os_error() {
        Some(code) if code == libc::EACCES || code == libc::EPERM => ErrorKind::Permission,
        _ if err.kind() == io::ErrorKind::WouldBlock => ErrorKind::Busy,
        _ => ErrorKind::Io,
    };
    Error::new(kind)
        .with_message("cannot lock ring file")
        .with_path(path)
        .with_source(err)
}

fn open_locked(path: &Path, sync: SyncMode) -> Result<File, Error> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    if sync == SyncMode::Sync {
        options.custom_flags(libc::O_DSYNC);
    }
    let file = options.open(path).map_err(|err| open_error(path, err))?;
    file.try_lock_exclusive()
        .map_err(|err| lock_error(path, err))?;
    Ok(file)
}

fn create_scratch(path: &Path, sync: SyncMode) -> Result<File, Error> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(true);
    if sync == SyncMode::Sync {
        options.custom_flags(libc::O_DSYNC);
    }
    let file = options.open(path).map_err(|err| open_error(path, err))?;
    file.try_lock_exclusive()
        .map_err(|err| lock_error(path, err))?;
    Ok(file)
}

fn encode_state(state: &RingState) -> [u8; STATE_SLOTS * SLOT_BYTES] {
    let mut buf = [0u8; STATE_SLOTS * SLOT_BYTES];
    buf[0..8].copy_from_slice(&(state.position().offset() as u64).to_le_bytes());
    buf[8..16].copy_from_slice(&(state.size() as u64).to_le_bytes());
    buf[16..24].copy_from_slice(&(state.capacity() as u64).to_le_bytes());
    buf
}

fn decode_state(buf: &[u8; STATE_SLOTS * SLOT_BYTES], path: &Path) -> Result<RingState, Error> {
    let slot = |index: usize| {
        let mut bytes = [0u8; SLOT_BYTES];
        bytes.copy_from_slice(&buf[index * SLOT_BYTES..(index + 1) * SLOT_BYTES]);
        u64::from_le_bytes(bytes)
    };
    let corrupt = |message: String| Error::new(ErrorKind::Corrupt).with_message(message).with_path(path);
    let to_usize = |value: u64, what: &str| {
        usize::try_from(value)
            .map_err(|_| corrupt(format!("stored {what} {value} does not fit this platform")))
    };
    let offset = to_usize(slot(0), "head offset")?;
    let size = to_usize(slot(1), "size")?;
    let capacity = to_usize(slot(2), "capacity")?;
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(corrupt(format!("stored capacity {capacity} is not a power of two")));
    }
    if size > capacity {
        return Err(corrupt(format!("stored size {size} exceeds capacity {capacity}")));
    }
    if offset >= capacity {
        return Err(corrupt(format!(
            "stored head offset {offset} is outside capacity {capacity}"
        )));
    }
    Ok(RingState::new(offset, 0, capacity, size))
}

fn copy_between(
    src: &File,
    src_offset: u64,
    dst: &File,
    dst_offset: u64,
    len: usize,
) -> io::Result<()> {
    let mut buf = [0u8; COPY_CHUNK];
    let mut copied = 0usize;
    while copied < len {
        let step = COPY_CHUNK.min(len - copied);
        src.read_exact_at(&mut buf[..step], src_offset + copied as u64)?;
        dst.write_all_at(&buf[..step], dst_offset + copied as u64)?;
        copied += step;
    }
    Ok(())
}

/// File-backed ring storage. Ring offsets map to file offsets past the
/// header; the file grows lazily as bytes land and is only truncated by a
/// shrink.
#[derive(Debug)]
pub struct FileStorage {
    file: Arc<File>,
    path: PathBuf,
    header_len: usize,
    capacity: usize,
    sync: SyncMode,
}

impl FileStorage {
    fn check_range(&self, offset: usize, len: usize, op: &str) -> Result<(), Error> {
        if offset.checked_add(len).is_none_or(|end| end > self.capacity) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "{op} of {len} bytes at {offset} exceeds capacity {}",
                    self.capacity
                ))
                .with_path(&self.path));
        }
        Ok(())
    }

    fn file_offset(&self, ring_offset: usize) -> u64 {
        (self.header_len + ring_offset) as u64
    }

    fn maybe_sync(&self) -> Result<(), Error> {
        if self.sync == SyncMode::Force {
            self.file.sync_data().map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("fdatasync failed")
                    .with_path(&self.path)
                    .with_source(err)
            })?;
        }
        Ok(())
    }

    fn slot_offset(&self, index: usize) -> Result<u64, Error> {
        let slot = STATE_SLOTS + index;
        if (slot + 1) * SLOT_BYTES > self.header_len {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("header slot {index} was not reserved at open"))
                .with_path(&self.path));
        }
        Ok((slot * SLOT_BYTES) as u64)
    }

    pub(crate) fn read_slot(&self, index: usize) -> Result<u64, Error> {
        let offset = self.slot_offset(index)?;
        let mut bytes = [0u8; SLOT_BYTES];
        self.file.read_exact_at(&mut bytes, offset).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("cannot read header slot {index}"))
                .with_path(&self.path)
                .with_source(err)
        })?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub(crate) fn write_slot(&self, index: usize, value: u64) -> Result<(), Error> {
        let offset = self.slot_offset(index)?;
        self.file
            .write_all_at(&value.to_le_bytes(), offset)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message(format!("cannot write header slot {index}"))
                    .with_path(&self.path)
                    .with_source(err)
            })?;
        self.maybe_sync()
    }

    /// Compacts the live extent into a fresh file at offset zero and swaps
    /// it into place: original to `.bak`, scratch to the original name,
    /// backup removed last. The scratch file carries a complete header
    /// before any rename, so every step leaves a loadable file behind.
    fn rewrite_compacted(&self, state: &RingState, new_capacity: usize) -> Result<Self, Error> {
        let scratch_path = append_suffix(&self.path, ".tmp");
        let backup_path = append_suffix(&self.path, ".bak");
        let scratch = create_scratch(&scratch_path, self.sync)?;

        let mut header = vec![0u8; self.header_len];
        self.file.read_exact_at(&mut header, 0).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("cannot read header for compaction")
                .with_path(&self.path)
                .with_source(err)
        })?;
        let compact_error = |err: io::Error| {
            Error::new(ErrorKind::Io)
                .with_message("cannot write compacted copy")
                .with_path(&scratch_path)
                .with_source(err)
        };
        scratch.write_all_at(&header, 0).map_err(compact_error)?;
        scratch
            .write_all_at(&encode_state(&state.shrink(new_capacity)), 0)
            .map_err(compact_error)?;
        for span in state.position().spans(state.size()) {
            copy_between(
                &self.file,
                self.file_offset(span.ring_offset),
                &scratch,
                (self.header_len + span.buf_offset) as u64,
                span.len,
            )
            .map_err(compact_error)?;
        }
        if self.sync == SyncMode::Force {
            scratch.sync_data().map_err(compact_error)?;
        }

        fs::rename(&self.path, &backup_path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("cannot move ring file to backup")
                .with_path(&self.path)
                .with_source(err)
        })?;
        if let Err(err) = fs::rename(&scratch_path, &self.path) {
            // Put the original back so the ring file name stays valid.
            if let Err(restore) = fs::rename(&backup_path, &self.path) {
                warn!(error = %restore, path = %self.path.display(), "cannot restore ring file from backup");
            }
            return Err(Error::new(ErrorKind::Io)
                .with_message("cannot move compacted copy into place")
                .with_path(&self.path)
                .with_source(err));
        }
        if let Err(err) = fs::remove_file(&backup_path) {
            warn!(error = %err, path = %backup_path.display(), "cannot remove shrink backup");
        }
        debug!(
            path = %self.path.display(),
            old_capacity = self.capacity,
            new_capacity,
            size = state.size(),
            "compacted ring file"
        );
        Ok(Self {
            file: Arc::new(scratch),
            path: self.path.clone(),
            header_len: self.header_len,
            capacity: new_capacity,
            sync: self.sync,
        })
    }

    /// Shrink fast path for a live extent already at offset zero: same
    /// inode, shorter length.
    fn truncate_in_place(&self, new_capacity: usize) -> Result<Self, Error> {
        self.file
            .set_len((self.header_len + new_capacity) as u64)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("cannot truncate ring file")
                    .with_path(&self.path)
                    .with_source(err)
            })?;
        Ok(Self {
            file: self.file.clone(),
            path: self.path.clone(),
            header_len: self.header_len,
            capacity: new_capacity,
            sync: self.sync,
        })
    }
}

impl Storage for FileStorage {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.check_range(offset, buf.len(), "read")?;
        self.file
            .read_exact_at(buf, self.file_offset(offset))
            .map_err(|err| {
                let kind = if err.kind() == io::ErrorKind::UnexpectedEof {
                    ErrorKind::Underflow
                } else {
                    ErrorKind::Io
                };
                Error::new(kind)
                    .with_message("ring range extends past the end of the file")
                    .with_path(&self.path)
                    .with_offset(offset as u64)
                    .with_source(err)
            })
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<(), Error> {
        self.check_range(offset, buf.len(), "write")?;
        self.file
            .write_all_at(buf, self.file_offset(offset))
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("cannot write ring bytes")
                    .with_path(&self.path)
                    .with_offset(offset as u64)
                    .with_source(err)
            })
    }

    /// Growth reuses the same file: offsets past the old capacity are
    /// simply valid now, and the file extends as they are written.
    fn allocate(&self, new_capacity: usize) -> Result<Self, Error> {
        Ok(Self {
            file: self.file.clone(),
            path: self.path.clone(),
            header_len: self.header_len,
            capacity: new_capacity,
            sync: self.sync,
        })
    }

    fn copy_to(&self, target: &Self, src: usize, dst: usize, len: usize) -> Result<(), Error> {
        self.check_range(src, len, "copy from")?;
        target.check_range(dst, len, "copy to")?;
        if len == 0 {
            return Ok(());
        }
        let shared_file = Arc::ptr_eq(&self.file, &target.file);
        if shared_file && src == dst {
            return Ok(());
        }
        let src_offset = self.file_offset(src);
        let dst_offset = target.file_offset(dst);
        let copy_error = |err: io::Error| {
            Error::new(ErrorKind::Io)
                .with_message(format!("cannot copy {len} ring bytes"))
                .with_path(&self.path)
                .with_source(err)
        };
        let overlapping = shared_file && src_offset < dst_offset && dst_offset < src_offset + len as u64;
        if !overlapping {
            return copy_between(&self.file, src_offset, &target.file, dst_offset, len)
                .map_err(copy_error);
        }
        // Forward overlap on one file: copy the chunks back to front.
        let mut buf = [0u8; COPY_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let step = COPY_CHUNK.min(remaining);
            remaining -= step;
            self.file
                .read_exact_at(&mut buf[..step], src_offset + remaining as u64)
                .map_err(copy_error)?;
            target
                .file
                .write_all_at(&buf[..step], dst_offset + remaining as u64)
                .map_err(copy_error)?;
        }
        Ok(())
    }

    fn store_state(&self, state: &RingState) -> Result<(), Error> {
        self.file
            .write_all_at(&encode_state(state), 0)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("cannot write ring header")
                    .with_path(&self.path)
                    .with_source(err)
            })?;
        self.maybe_sync()
    }
}

/// A [`Ring`] persisted in a single locked file. Reopening restores the
/// buffered bytes; see [`FileRing::open`] for the capacity rules.
#[derive(Clone, Debug)]
pub struct FileRing {
    ring: Ring<FileStorage>,
    path: PathBuf,
    options: FileRingOptions,
}

impl FileRing {
    /// Opens or creates the ring file at `path` and takes its exclusive
    /// lock. An empty file starts fresh at the requested capacity. An
    /// existing file keeps its stored capacity, except that a larger
    /// request migrates the file up: the wrapped prefix physically moves
    /// past the old end so the live extent stays contiguous in ring
    /// order. A smaller request never shrinks here; that is what
    /// [`shrink`](FileRing::shrink) is for.
    pub fn open(path: impl AsRef<Path>, options: FileRingOptions) -> Result<Self, Error> {
        let path = path.as_ref();
        let (capacity, limit) = validate_capacity(options.capacity, options.limit)?;
        let header_len = (STATE_SLOTS + options.extra_header_slots) * SLOT_BYTES;
        let file = open_locked(path, options.sync)?;
        let len = file
            .metadata()
            .map_err(|err| open_error(path, err))?
            .len();
        let storage = FileStorage {
            file: Arc::new(file),
            path: path.to_path_buf(),
            header_len,
            capacity,
            sync: options.sync,
        };

        let (storage, state) = if len == 0 {
            let state = RingState::start(capacity);
            storage.store_state(&state)?;
            for index in 0..options.extra_header_slots {
                storage.write_slot(index, 0)?;
            }
            debug!(path = %path.display(), capacity, "created ring file");
            (storage, state)
        } else {
            if len < header_len as u64 {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!("file of {len} bytes is shorter than its header"))
                    .with_path(path));
            }
            let mut buf = [0u8; STATE_SLOTS * SLOT_BYTES];
            storage.file.read_exact_at(&mut buf, 0).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("cannot read ring header")
                    .with_path(path)
                    .with_source(err)
            })?;
            let stored = decode_state(&buf, path)?;
            if capacity > stored.capacity() {
                let migrated = storage.allocate(capacity)?;
                if stored.wrapped() {
                    migrated.copy_to(&migrated, 0, stored.capacity(), stored.write_offset())?;
                }
                let state = stored.with_capacity(capacity);
                migrated.store_state(&state)?;
                debug!(
                    path = %path.display(),
                    stored_capacity = stored.capacity(),
                    capacity,
                    "migrated ring file to a larger capacity"
                );
                (migrated, state)
            } else {
                debug!(
                    path = %path.display(),
                    capacity = stored.capacity(),
                    size = stored.size(),
                    "opened ring file"
                );
                (storage.allocate(stored.capacity())?, stored)
            }
        };

        Ok(Self {
            ring: Ring::from_parts(storage, state, limit, options.write_wait, options.read_wait),
            path: path.to_path_buf(),
            options,
        })
    }

    /// Decodes the header of a ring file without locking or opening it
    /// for writing. Safe to run against a live ring.
    pub fn inspect(path: impl AsRef<Path>) -> Result<FileHeader, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| open_error(path, err))?;
        let len = file
            .metadata()
            .map_err(|err| open_error(path, err))?
            .len();
        if len < (STATE_SLOTS * SLOT_BYTES) as u64 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("file of {len} bytes is shorter than its header"))
                .with_path(path));
        }
        let mut buf = [0u8; STATE_SLOTS * SLOT_BYTES];
        file.read_exact_at(&mut buf, 0).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("cannot read ring header")
                .with_path(path)
                .with_source(err)
        })?;
        let state = decode_state(&buf, path)?;
        Ok(FileHeader {
            head_offset: state.position().offset(),
            size: state.size(),
            capacity: state.capacity(),
            wrapped: state.wrapped(),
            file_len: len,
        })
    }

    /// Compacts the file down to the requested capacity, or to the next
    /// power of two that still holds the buffered bytes, whichever is
    /// larger. A no-op when that is not smaller than the current
    /// capacity. Fails with `Busy` while a writer stream is open.
    pub fn shrink(&self) -> Result<usize, Error> {
        let (floor, _) = validate_capacity(self.options.capacity, self.options.limit)?;
        self.ring.shared().with_exclusive(|inner| {
            let state = inner.state;
            let required = floor.max(state.size().next_power_of_two());
            if required >= state.capacity() {
                return Ok(state.capacity());
            }
            let head = state.position();
            let compacted = if state.size() > 0 && head.offset() > 0 {
                inner.storage.rewrite_compacted(&state, required)?
            } else {
                inner.storage.truncate_in_place(required)?
            };
            let next = state.shrink(required);
            for slot in &mut inner.readers {
                slot.position = slot.position.shrink(&head, required);
            }
            inner.state = next;
            inner.storage = Arc::new(compacted);
            inner.generation += 1;
            inner.storage.store_state(&next)?;
            Ok(required)
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> FileRingOptions {
        self.options
    }

    pub fn size(&self) -> usize {
        self.ring.size()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn info(&self) -> RingInfo {
        self.ring.info()
    }

    pub fn reader(&self) -> Result<Reader<FileStorage>, Error> {
        self.ring.reader()
    }

    pub fn writer(&self) -> Result<Writer<FileStorage>, Error> {
        self.ring.writer()
    }

    pub fn remove(&self, len: usize) -> Result<usize, Error> {
        self.ring.remove(len)
    }

    pub fn interrupt(&self) {
        self.ring.interrupt()
    }

    pub fn close(&self) {
        self.ring.close()
    }

    /// Reads a reserved header slot on the current backing file.
    pub(crate) fn read_extra_slot(&self, index: usize) -> Result<u64, Error> {
        self.ring.shared().storage().read_slot(index)
    }

    /// Writes a reserved header slot on the current backing file.
    pub(crate) fn write_extra_slot(&self, index: usize, value: u64) -> Result<(), Error> {
        self.ring.shared().storage().write_slot(index, value)
    }
}

// Flat byte stores backing a ring: positioned access, no ring semantics.
use std::ptr;

use memmap2::{MmapOptions, MmapRaw};

use crate::core::error::{Error, ErrorKind};
use crate::core::state::RingState;

/// A linear byte store addressed `0..capacity`.
///
/// Reads and writes take `&self`: the engine's protocol guarantees the
/// writer only touches bytes outside every published range, and readers
/// validate their snapshots after copying, so racing copies are discarded
/// rather than observed.
pub trait Storage: Send + Sync + Sized {
    fn capacity(&self) -> usize;

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error>;

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<(), Error>;

    /// A store of `new_capacity` bytes for growth. Media that can grow in
    /// place (files) return a handle to the same backing resource.
    fn allocate(&self, new_capacity: usize) -> Result<Self, Error>;

    /// Copies `len` bytes into `target`, which may share this store's
    /// backing resource.
    fn copy_to(&self, target: &Self, src: usize, dst: usize, len: usize) -> Result<(), Error>;

    /// Persists the ring state on media that survive restarts.
    fn store_state(&self, state: &RingState) -> Result<(), Error> {
        let _ = state;
        Ok(())
    }
}

/// Anonymous-mapping store for memory-backed rings.
#[derive(Debug)]
pub struct MemoryStorage {
    map: MmapRaw,
    capacity: usize,
}

impl MemoryStorage {
    pub fn new(capacity: usize) -> Result<Self, Error> {
        let map = MmapOptions::new()
            .len(capacity)
            .map_anon()
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message(format!("failed to map {capacity} anonymous bytes"))
                    .with_source(err)
            })?;
        Ok(Self {
            map: MmapRaw::from(map),
            capacity,
        })
    }

    fn check_range(&self, offset: usize, len: usize, op: &str) -> Result<(), Error> {
        if offset.checked_add(len).is_none_or(|end| end > self.capacity) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "{op} of {len} bytes overruns capacity {}",
                    self.capacity
                ))
                .with_offset(offset as u64));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.check_range(offset, buf.len(), "read")?;
        // SAFETY: range checked above; a copy racing a relocation is
        // discarded by the reader's validation pass.
        unsafe {
            ptr::copy_nonoverlapping(self.map.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<(), Error> {
        self.check_range(offset, buf.len(), "write")?;
        // SAFETY: range checked above; the writer protocol keeps this range
        // disjoint from every published byte.
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.map.as_mut_ptr().add(offset), buf.len());
        }
        Ok(())
    }

    fn allocate(&self, new_capacity: usize) -> Result<Self, Error> {
        Self::new(new_capacity)
    }

    fn copy_to(&self, target: &Self, src: usize, dst: usize, len: usize) -> Result<(), Error> {
        self.check_range(src, len, "copy")?;
        target.check_range(dst, len, "copy")?;
        if ptr::eq(self.map.as_ptr(), target.map.as_ptr()) {
            if src == dst {
                return Ok(());
            }
            // SAFETY: same mapping, ranges checked; copy handles overlap.
            unsafe {
                ptr::copy(self.map.as_ptr().add(src), target.map.as_mut_ptr().add(dst), len);
            }
        } else {
            // SAFETY: distinct mappings, ranges checked on both sides.
            unsafe {
                ptr::copy_nonoverlapping(
                    self.map.as_ptr().add(src),
                    target.map.as_mut_ptr().add(dst),
                    len,
                );
            }
        }
        Ok(())
    }
}

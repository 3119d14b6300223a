//! Purpose: The ring engine: one writer, many readers, in-place growth.
//! Exports: `Ring`, `RingOptions`, `RingInfo`, plus the shared engine state
//! the reader/writer streams operate through.
//! Role: Owns the current state/storage pair and totally orders replacements.
//! Invariants: State and storage swap together under one lock; byte copies
//! never run under that lock. The generation counter bumps exactly when
//! published bytes physically move.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::notify::{Deadline, Wait};
use crate::core::reader::Reader;
use crate::core::state::{RingPosition, RingState};
use crate::core::storage::{MemoryStorage, Storage};
use crate::core::writer::Writer;

/// Construction options for a memory-backed ring.
#[derive(Clone, Copy, Debug)]
pub struct RingOptions {
    /// Initial capacity in bytes, rounded up to a power of two.
    pub capacity: usize,
    /// Hard ceiling on growth; 0 means unbounded.
    pub limit: usize,
    /// Policy when a write needs more space than the limit allows.
    pub write_wait: Wait,
    /// Policy for blocking reads on an empty ring.
    pub read_wait: Wait,
}

impl Default for RingOptions {
    fn default() -> Self {
        Self {
            capacity: 4 * 1024,
            limit: 0,
            write_wait: Wait::Never,
            read_wait: Wait::Forever,
        }
    }
}

/// Point-in-time view of a ring, cheap to take, safe to hold.
#[derive(Clone, Copy, Debug)]
pub struct RingInfo {
    pub capacity: usize,
    pub limit: usize,
    pub size: usize,
    pub head_offset: usize,
    pub head_cycle: i64,
    pub wrapped: bool,
    pub readers: usize,
    pub writer_live: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Lifecycle {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
pub(crate) struct ReaderSlot {
    pub(crate) id: u64,
    pub(crate) position: RingPosition,
}

#[derive(Debug)]
pub(crate) struct Inner<S> {
    pub(crate) storage: Arc<S>,
    pub(crate) state: RingState,
    pub(crate) generation: u64,
    pub(crate) readers: Vec<ReaderSlot>,
    pub(crate) next_reader_id: u64,
    pub(crate) writer_live: bool,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) interrupts: u64,
}

impl<S> Inner<S> {
    fn slot(&self, id: u64) -> Result<&ReaderSlot, Error> {
        self.readers
            .iter()
            .find(|slot| slot.id == id)
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("reader is closed"))
    }

    fn slot_mut(&mut self, id: u64) -> Result<&mut ReaderSlot, Error> {
        self.readers
            .iter_mut()
            .find(|slot| slot.id == id)
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("reader is closed"))
    }

    fn info(&self, limit: usize) -> RingInfo {
        RingInfo {
            capacity: self.state.capacity(),
            limit,
            size: self.state.size(),
            head_offset: self.state.position().offset(),
            head_cycle: self.state.position().cycle(),
            wrapped: self.state.wrapped(),
            readers: self.readers.len(),
            writer_live: self.writer_live,
        }
    }
}

/// Reader-side capture: everything needed to copy bytes without the lock.
pub(crate) struct Snapshot<S> {
    pub(crate) storage: Arc<S>,
    pub(crate) state: RingState,
    pub(crate) position: RingPosition,
    pub(crate) generation: u64,
}

#[derive(Debug)]
pub(crate) struct Shared<S: Storage> {
    inner: Mutex<Inner<S>>,
    /// Signaled on publish, eviction, relocation, interrupt and close.
    data: Condvar,
    /// Signaled on writer release, interrupt and close.
    writer_slot: Condvar,
    limit: usize,
    write_wait: Wait,
    read_wait: Wait,
}

impl<S: Storage> Shared<S> {
    fn lock_inner(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner<S>>) -> MutexGuard<'a, Inner<S>> {
        self.data.wait(guard).unwrap_or_else(|err| err.into_inner())
    }

    fn wait_deadline<'a>(
        &self,
        guard: MutexGuard<'a, Inner<S>>,
        deadline: &Deadline,
    ) -> MutexGuard<'a, Inner<S>> {
        match deadline.remaining() {
            None => self.wait(guard),
            Some(remaining) => {
                self.data
                    .wait_timeout(guard, remaining)
                    .unwrap_or_else(|err| err.into_inner())
                    .0
            }
        }
    }

    pub(crate) fn read_wait(&self) -> Wait {
        self.read_wait
    }

    pub(crate) fn storage(&self) -> Arc<S> {
        self.lock_inner().storage.clone()
    }

    fn available_to_write(&self, state: &RingState) -> i64 {
        let capacity = state.capacity();
        let effective = if self.limit > 0 {
            self.limit.min(capacity)
        } else {
            capacity
        };
        effective as i64 - state.size() as i64
    }

    /// Makes room for `staged + len` unpublished bytes and returns the
    /// storage plus the position where the next byte goes. Grows in place
    /// when the limit allows, otherwise waits for evictions per the write
    /// policy. The byte copy of a growth runs outside the lock.
    pub(crate) fn prepare_write(
        &self,
        staged: usize,
        len: usize,
    ) -> Result<(Arc<S>, RingPosition), Error> {
        let additional = staged + len;
        let mut guard = self.lock_inner();
        loop {
            if guard.lifecycle != Lifecycle::Open {
                return Err(Error::new(ErrorKind::Closed).with_message("ring is closed for writing"));
            }
            let state = guard.state;
            let available = self.available_to_write(&state);
            if available >= additional as i64 {
                return Ok((guard.storage.clone(), state.write_position(staged)));
            }

            let needed = state.capacity() as i64 + (additional as i64 - available);
            let new_capacity = usize::try_from(needed)
                .ok()
                .and_then(usize::checked_next_power_of_two)
                .ok_or_else(|| {
                    Error::new(ErrorKind::Overflow)
                        .with_message(format!("cannot grow ring to hold {additional} more bytes"))
                })?;

            if self.limit == 0 || new_capacity <= self.limit {
                let storage = guard.storage.clone();
                let from_state = state;
                drop(guard);
                let grown = grow(storage.as_ref(), &from_state, staged, new_capacity)?;
                guard = self.lock_inner();
                guard.state = guard.state.update_capacity(new_capacity, &from_state);
                for slot in &mut guard.readers {
                    slot.position = slot.position.update_capacity(new_capacity, &from_state);
                }
                guard.storage = Arc::new(grown);
                guard.generation += 1;
                guard.storage.store_state(&guard.state)?;
                self.data.notify_all();
                continue;
            }

            if !self.write_wait.blocks() {
                return Err(Error::new(ErrorKind::Overflow).with_message(format!(
                    "write of {len} bytes needs capacity {new_capacity}, limit is {}",
                    self.limit
                )));
            }

            let deadline = Deadline::start(self.write_wait);
            let token = guard.interrupts;
            loop {
                if guard.lifecycle != Lifecycle::Open {
                    return Err(
                        Error::new(ErrorKind::Closed).with_message("ring closed while waiting")
                    );
                }
                if guard.interrupts != token {
                    return Err(Error::new(ErrorKind::Interrupted)
                        .with_message("write wait interrupted"));
                }
                if self.available_to_write(&guard.state) >= additional as i64 {
                    break;
                }
                if deadline.expired() {
                    return Err(Error::new(ErrorKind::Timeout).with_message(format!(
                        "timed out waiting for {additional} free bytes (limit {})",
                        self.limit
                    )));
                }
                guard = self.wait_deadline(guard, &deadline);
            }
        }
    }

    /// Publishes `staged` bytes: the only operation that grows `size`.
    pub(crate) fn publish(&self, staged: usize) -> Result<(), Error> {
        if staged == 0 {
            return Ok(());
        }
        let mut guard = self.lock_inner();
        if guard.lifecycle == Lifecycle::Closed {
            return Err(Error::new(ErrorKind::Closed).with_message("ring closed before flush"));
        }
        guard.state = guard.state.increment_size(staged);
        let result = guard.storage.store_state(&guard.state);
        drop(guard);
        self.data.notify_all();
        result
    }

    pub(crate) fn release_writer(&self) {
        let mut guard = self.lock_inner();
        guard.writer_live = false;
        drop(guard);
        self.writer_slot.notify_all();
    }

    pub(crate) fn snapshot(&self, id: u64) -> Result<Snapshot<S>, Error> {
        let guard = self.lock_inner();
        if guard.lifecycle == Lifecycle::Closed {
            return Err(Error::new(ErrorKind::Closed).with_message("ring is closed"));
        }
        let position = guard.slot(id)?.position;
        Ok(Snapshot {
            storage: guard.storage.clone(),
            state: guard.state,
            position,
            generation: guard.generation,
        })
    }

    /// Commits an unlocked copy. `Ok(false)` means the bytes moved under
    /// the copy (growth or shrink) and the caller must retry; `FellBehind`
    /// means an eviction overtook the snapshot position.
    pub(crate) fn commit_read(
        &self,
        id: u64,
        snapshot: &Snapshot<S>,
        advanced: usize,
    ) -> Result<bool, Error> {
        let mut guard = self.lock_inner();
        if guard.generation != snapshot.generation {
            return Ok(false);
        }
        if guard.state.position().after(&snapshot.position) {
            return Err(fell_behind());
        }
        let slot = guard.slot_mut(id)?;
        slot.position = slot.position.advance(advanced as isize);
        Ok(true)
    }

    /// True when the generation moved past the snapshot, meaning a copy
    /// failure was caused by a concurrent relocation rather than a real
    /// storage problem.
    pub(crate) fn is_stale(&self, snapshot: &Snapshot<S>) -> bool {
        self.lock_inner().generation != snapshot.generation
    }

    /// Blocks per the read policy until the reader sees a non-zero
    /// available count, then returns it.
    pub(crate) fn wait_readable(&self, id: u64) -> Result<usize, Error> {
        let mut guard = self.lock_inner();
        let mut deadline: Option<Deadline> = None;
        let mut token: Option<u64> = None;
        loop {
            if guard.lifecycle == Lifecycle::Closed {
                return Err(Error::new(ErrorKind::Closed).with_message("ring is closed"));
            }
            let position = guard.slot(id)?.position;
            match guard.state.available_to_read(&position) {
                None => return Err(fell_behind()),
                Some(0) => {}
                Some(available) => return Ok(available),
            }
            if let Some(token) = token {
                if guard.interrupts != token {
                    return Err(
                        Error::new(ErrorKind::Interrupted).with_message("read wait interrupted")
                    );
                }
            }
            if !self.read_wait.blocks() {
                return Err(Error::new(ErrorKind::Timeout).with_message("no data available"));
            }
            let deadline = deadline.get_or_insert_with(|| Deadline::start(self.read_wait));
            token.get_or_insert(guard.interrupts);
            if deadline.expired() {
                return Err(Error::new(ErrorKind::Timeout).with_message("timed out waiting for data"));
            }
            guard = self.wait_deadline(guard, deadline);
        }
    }

    pub(crate) fn skip(&self, id: u64, len: usize) -> Result<usize, Error> {
        let mut guard = self.lock_inner();
        if guard.lifecycle == Lifecycle::Closed {
            return Err(Error::new(ErrorKind::Closed).with_message("ring is closed"));
        }
        let state = guard.state;
        let slot = guard.slot_mut(id)?;
        let available = state
            .available_to_read(&slot.position)
            .ok_or_else(fell_behind)?;
        let skipped = len.min(available);
        slot.position = slot.position.advance(skipped as isize);
        Ok(skipped)
    }

    pub(crate) fn available(&self, id: u64) -> usize {
        let guard = self.lock_inner();
        guard
            .slot(id)
            .ok()
            .and_then(|slot| guard.state.available_to_read(&slot.position))
            .unwrap_or(0)
    }

    pub(crate) fn deregister(&self, id: u64) {
        let mut guard = self.lock_inner();
        guard.readers.retain(|slot| slot.id != id);
    }

    /// Runs `f` with the engine exclusively held: no live writer, lock
    /// held throughout. Used by media-level reshapes (file shrink).
    pub(crate) fn with_exclusive<R>(
        &self,
        f: impl FnOnce(&mut Inner<S>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut guard = self.lock_inner();
        if guard.lifecycle != Lifecycle::Open {
            return Err(Error::new(ErrorKind::Closed).with_message("ring is closed"));
        }
        if guard.writer_live {
            return Err(Error::new(ErrorKind::Busy).with_message("a writer stream is open"));
        }
        let result = f(&mut guard);
        drop(guard);
        self.data.notify_all();
        result
    }
}

pub(crate) fn fell_behind() -> Error {
    Error::new(ErrorKind::FellBehind).with_message("unread bytes were evicted behind this reader")
}

/// Copies the preserved extent (published plus staged bytes) into freshly
/// allocated storage, keeping physical offsets except for the wrapped
/// prefix, which lands at the old capacity boundary.
fn grow<S: Storage>(
    storage: &S,
    from: &RingState,
    staged: usize,
    new_capacity: usize,
) -> Result<S, Error> {
    debug!(
        old_capacity = from.capacity(),
        new_capacity,
        size = from.size(),
        staged,
        "growing ring storage"
    );
    let target = storage.allocate(new_capacity)?;
    let preserve = from.size() + staged;
    if preserve > 0 {
        let head = from.position().offset();
        let old_capacity = from.capacity();
        if head + preserve > old_capacity {
            let tail = old_capacity - head;
            storage.copy_to(&target, head, head, tail)?;
            storage.copy_to(&target, 0, old_capacity, preserve - tail)?;
        } else {
            storage.copy_to(&target, head, head, preserve)?;
        }
    }
    Ok(target)
}

pub(crate) fn validate_capacity(capacity: usize, limit: usize) -> Result<(usize, usize), Error> {
    if capacity == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("capacity must be positive"));
    }
    let capacity = capacity.checked_next_power_of_two().ok_or_else(|| {
        Error::new(ErrorKind::Usage).with_message(format!("capacity {capacity} is too large"))
    })?;
    if limit > 0 && limit < capacity {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("limit {limit} is smaller than capacity {capacity}")));
    }
    Ok((capacity, limit))
}

/// A growable circular byte buffer with one writer stream and any number
/// of independent reader streams. Cheap to clone; clones share the buffer.
#[derive(Debug)]
pub struct Ring<S: Storage> {
    shared: Arc<Shared<S>>,
}

impl<S: Storage> Clone for Ring<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Ring<MemoryStorage> {
    pub fn in_memory(options: RingOptions) -> Result<Self, Error> {
        let (capacity, limit) = validate_capacity(options.capacity, options.limit)?;
        let storage = MemoryStorage::new(capacity)?;
        Ok(Self::from_parts(
            storage,
            RingState::start(capacity),
            limit,
            options.write_wait,
            options.read_wait,
        ))
    }
}

impl<S: Storage> Ring<S> {
    pub(crate) fn from_parts(
        storage: S,
        state: RingState,
        limit: usize,
        write_wait: Wait,
        read_wait: Wait,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    storage: Arc::new(storage),
                    state,
                    generation: 0,
                    readers: Vec::new(),
                    next_reader_id: 0,
                    writer_live: false,
                    lifecycle: Lifecycle::Open,
                    interrupts: 0,
                }),
                data: Condvar::new(),
                writer_slot: Condvar::new(),
                limit,
                write_wait,
                read_wait,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<S>> {
        &self.shared
    }

    pub fn size(&self) -> usize {
        self.shared.lock_inner().state.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock_inner().state.capacity()
    }

    pub fn info(&self) -> RingInfo {
        self.shared.lock_inner().info(self.shared.limit)
    }

    /// Opens an independent reader stream positioned at the current head:
    /// it observes everything buffered now plus everything published later.
    pub fn reader(&self) -> Result<Reader<S>, Error> {
        let mut guard = self.shared.lock_inner();
        if guard.lifecycle != Lifecycle::Open {
            return Err(Error::new(ErrorKind::Closed).with_message("ring is closed"));
        }
        let id = guard.next_reader_id;
        guard.next_reader_id += 1;
        let position = guard.state.position();
        guard.readers.push(ReaderSlot { id, position });
        Ok(Reader::new(self.shared.clone(), id))
    }

    /// Claims the single writer stream, blocking while another one is
    /// live. The claim is released when the returned stream drops.
    pub fn writer(&self) -> Result<Writer<S>, Error> {
        let mut guard = self.shared.lock_inner();
        let token = guard.interrupts;
        while guard.writer_live {
            if guard.lifecycle != Lifecycle::Open {
                return Err(Error::new(ErrorKind::Closed).with_message("ring is closed"));
            }
            if guard.interrupts != token {
                return Err(Error::new(ErrorKind::Interrupted)
                    .with_message("writer acquisition interrupted"));
            }
            guard = self
                .shared
                .writer_slot
                .wait(guard)
                .unwrap_or_else(|err| err.into_inner());
        }
        if guard.lifecycle != Lifecycle::Open {
            return Err(Error::new(ErrorKind::Closed).with_message("ring is closed"));
        }
        guard.writer_live = true;
        Ok(Writer::new(self.shared.clone()))
    }

    /// Evicts up to `len` bytes from the head and returns the count
    /// actually evicted.
    pub fn remove(&self, len: usize) -> Result<usize, Error> {
        let mut guard = self.shared.lock_inner();
        if guard.lifecycle != Lifecycle::Open {
            return Err(Error::new(ErrorKind::Closed).with_message("ring is closed"));
        }
        let evicted = len.min(guard.state.size());
        if evicted > 0 {
            guard.state = guard.state.remove(evicted);
            guard.storage.store_state(&guard.state)?;
            drop(guard);
            self.shared.data.notify_all();
        }
        Ok(evicted)
    }

    /// Wakes every wait currently blocked on this ring with `Interrupted`,
    /// without closing it. Later waits proceed normally.
    pub fn interrupt(&self) {
        let mut guard = self.shared.lock_inner();
        guard.interrupts += 1;
        drop(guard);
        self.shared.data.notify_all();
        self.shared.writer_slot.notify_all();
    }

    /// Closes the ring: new readers, writers and evictions are rejected,
    /// blocked waits wake with `Closed`, and a live writer stream may
    /// finish its flush first. Blocks until that writer releases.
    /// `size()` and `info()` keep working afterwards.
    pub fn close(&self) {
        let mut guard = self.shared.lock_inner();
        if guard.lifecycle == Lifecycle::Closed {
            return;
        }
        if guard.lifecycle == Lifecycle::Open {
            debug!("closing ring");
            guard.lifecycle = Lifecycle::Closing;
        }
        self.shared.data.notify_all();
        self.shared.writer_slot.notify_all();
        while guard.writer_live {
            guard = self
                .shared
                .writer_slot
                .wait(guard)
                .unwrap_or_else(|err| err.into_inner());
        }
        guard.lifecycle = Lifecycle::Closed;
        drop(guard);
        self.shared.data.notify_all();
        self.shared.writer_slot.notify_all();
    }
}

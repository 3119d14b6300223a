//! Purpose: A persistent FIFO of discrete elements over one ring file.
//! Exports: `ElementQueue`, `QueueCursor`.
//! Role: Frames each element as a little-endian u32 length prefix plus
//! payload and keeps the element count in a reserved header slot.
//! Consumption is split into poll and commit so a crash between the two
//! redelivers the element instead of losing it.
//! Invariants: Offers publish whole frames, so a non-empty queue always
//! exposes the complete element at its head. The stored count is
//! advisory; open recounts by walking the prefixes and trusts the walk.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::api::codec::Codec;
use crate::core::error::{Error, ErrorKind};
use crate::core::file::{FileRing, FileRingOptions, FileStorage};
use crate::core::reader::Reader;

const COUNT_SLOT: usize = 0;
const PREFIX_BYTES: usize = 4;

fn read_frame_bytes(reader: &mut Reader<FileStorage>, buf: &mut [u8]) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.try_read(&mut buf[filled..])?;
        if n == 0 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("element framing ends inside a frame"));
        }
        filled += n;
    }
    Ok(())
}

fn read_prefix(reader: &mut Reader<FileStorage>) -> Result<usize, Error> {
    let mut prefix = [0u8; PREFIX_BYTES];
    read_frame_bytes(reader, &mut prefix)?;
    let len = u32::from_le_bytes(prefix) as usize;
    let available = reader.available();
    if len > available {
        return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
            "element of {len} bytes overruns the {available} buffered"
        )));
    }
    Ok(len)
}

/// Counts the buffered elements by walking the length prefixes.
fn walk_elements(ring: &FileRing) -> Result<u64, Error> {
    let mut reader = ring.reader()?;
    let mut remaining = reader.available();
    let mut count = 0u64;
    while remaining > 0 {
        if remaining < PREFIX_BYTES {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "element framing ends inside a length prefix ({remaining} bytes left)"
                ))
                .with_path(ring.path()));
        }
        let len = read_prefix(&mut reader).map_err(|err| err.with_path(ring.path()))?;
        reader.skip(len)?;
        remaining -= PREFIX_BYTES + len;
        count += 1;
    }
    Ok(count)
}

#[derive(Debug)]
struct Pending<T> {
    wire_len: usize,
    value: T,
}

#[derive(Debug)]
struct Consumer<T> {
    reader: Reader<FileStorage>,
    pending: Option<Pending<T>>,
}

/// A FIFO queue of typed elements persisted in one ring file.
///
/// One consumer at a time makes progress through [`poll`](ElementQueue::poll)
/// and [`commit`](ElementQueue::commit); offers may come from any thread and
/// serialize on the ring's writer slot.
#[derive(Debug)]
pub struct ElementQueue<T, C: Codec<T>> {
    ring: FileRing,
    codec: C,
    consumer: Mutex<Consumer<T>>,
    count: AtomicU64,
}

impl<T, C: Codec<T>> ElementQueue<T, C> {
    /// Opens or creates the queue file, reserving a header slot for the
    /// element count. The buffered framing is walked on every open; a
    /// stored count that disagrees with the walk is logged and replaced.
    pub fn open(path: impl AsRef<Path>, codec: C, options: FileRingOptions) -> Result<Self, Error> {
        let options = FileRingOptions {
            extra_header_slots: options.extra_header_slots.max(1),
            ..options
        };
        let ring = FileRing::open(path, options)?;
        let stored = ring.read_extra_slot(COUNT_SLOT)?;
        let walked = walk_elements(&ring)?;
        if stored != walked {
            warn!(
                path = %ring.path().display(),
                stored,
                walked,
                "stored element count disagrees with the framing walk"
            );
            ring.write_extra_slot(COUNT_SLOT, walked)?;
        }
        let reader = ring.reader()?;
        Ok(Self {
            ring,
            codec,
            consumer: Mutex::new(Consumer {
                reader,
                pending: None,
            }),
            count: AtomicU64::new(walked),
        })
    }

    fn lock_consumer(&self) -> std::sync::MutexGuard<'_, Consumer<T>> {
        self.consumer.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn store_count(&self, value: u64) -> Result<(), Error> {
        self.ring.write_extra_slot(COUNT_SLOT, value)
    }

    /// Encodes and appends `elements` as one published batch, then
    /// advances the count. Blocks or fails per the ring's write policy
    /// when the batch does not fit under the growth limit.
    pub fn offer(&self, elements: &[T]) -> Result<(), Error> {
        if elements.is_empty() {
            return Ok(());
        }
        let mut frames = Vec::with_capacity(self.ring.options().writer_buffer);
        let mut payload = Vec::new();
        for element in elements {
            payload.clear();
            self.codec.encode(element, &mut payload)?;
            let len = u32::try_from(payload.len()).map_err(|_| {
                Error::new(ErrorKind::Usage).with_message(format!(
                    "element of {} bytes exceeds the frame limit",
                    payload.len()
                ))
            })?;
            frames.extend_from_slice(&len.to_le_bytes());
            frames.extend_from_slice(&payload);
        }
        let mut writer = self.ring.writer()?;
        writer.write(&frames)?;
        writer.flush()?;
        let added = elements.len() as u64;
        let total = self.count.fetch_add(added, Ordering::AcqRel) + added;
        // Persisted while the writer slot is still held, so concurrent
        // offers cannot reorder their count writes.
        self.store_count(total)
    }

    /// Appends pre-framed bytes without re-encoding. `added` is the
    /// element count inside `frames`.
    fn offer_raw(&self, frames: &[u8], added: u64) -> Result<(), Error> {
        let mut writer = self.ring.writer()?;
        writer.write(frames)?;
        writer.flush()?;
        let total = self.count.fetch_add(added, Ordering::AcqRel) + added;
        self.store_count(total)
    }

    /// The head element, blocking per the ring's read policy when the
    /// queue is empty. `Ok(None)` when the policy gives up first.
    /// Repeated polls return the same element until it is committed.
    pub fn poll(&self) -> Result<Option<T>, Error>
    where
        T: Clone,
    {
        let mut consumer = self.lock_consumer();
        if let Some(pending) = &consumer.pending {
            return Ok(Some(pending.value.clone()));
        }
        if consumer.reader.available() < PREFIX_BYTES {
            match consumer.reader.wait_readable() {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Timeout => return Ok(None),
                Err(err) => return Err(err),
            }
        }
        let len = read_prefix(&mut consumer.reader)?;
        let mut payload = vec![0u8; len];
        read_frame_bytes(&mut consumer.reader, &mut payload)?;
        let value = match self.codec.decode(&payload) {
            Ok(value) => value,
            Err(err) => {
                // Evict the undecodable frame so the queue does not wedge
                // on it; the cursor is already past it.
                warn!(
                    path = %self.ring.path().display(),
                    bytes = len,
                    "dropping an element that does not decode"
                );
                self.ring.remove(PREFIX_BYTES + len)?;
                let total = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
                self.store_count(total)?;
                return Err(err);
            }
        };
        consumer.pending = Some(Pending {
            wire_len: PREFIX_BYTES + len,
            value: value.clone(),
        });
        Ok(Some(value))
    }

    /// Evicts the last polled element and decrements the count. A commit
    /// with nothing polled is a no-op.
    pub fn commit(&self) -> Result<(), Error> {
        let mut consumer = self.lock_consumer();
        let Some(pending) = consumer.pending.take() else {
            return Ok(());
        };
        self.ring.remove(pending.wire_len)?;
        let total = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        self.store_count(total)
    }

    /// Evicts every element and zeroes the count. Call on a quiescent
    /// queue; an offer racing the clear may survive it.
    pub fn clear(&self) -> Result<(), Error> {
        let mut consumer = self.lock_consumer();
        consumer.pending = None;
        self.ring.remove(self.ring.size())?;
        consumer.reader = self.ring.reader()?;
        self.count.store(0, Ordering::Release);
        self.store_count(0)
    }

    /// Moves up to `elements` head elements into `target` as raw frames:
    /// read here, offered there, then evicted here. Returns the count
    /// moved. Fails with `Busy` while an uncommitted poll is pending.
    pub fn transfer_to(&self, target: &Self, elements: u64) -> Result<u64, Error> {
        if elements == 0 {
            return Ok(0);
        }
        let mut consumer = self.lock_consumer();
        if consumer.pending.is_some() {
            return Err(Error::new(ErrorKind::Busy)
                .with_message("commit or clear the polled element before transferring"));
        }
        let moved = elements.min(self.count.load(Ordering::Acquire));
        if moved == 0 {
            return Ok(0);
        }
        let mut frames = Vec::new();
        let staged = (|| {
            for _ in 0..moved {
                let len = read_prefix(&mut consumer.reader)?;
                let start = frames.len();
                frames.resize(start + PREFIX_BYTES + len, 0);
                frames[start..start + PREFIX_BYTES].copy_from_slice(&(len as u32).to_le_bytes());
                read_frame_bytes(&mut consumer.reader, &mut frames[start + PREFIX_BYTES..])?;
            }
            target.offer_raw(&frames, moved)
        })();
        if let Err(err) = staged {
            // Nothing was evicted here; rewind the cursor to the head so
            // the elements stay pollable.
            consumer.reader = self.ring.reader()?;
            return Err(err);
        }
        self.ring.remove(frames.len())?;
        let total = self.count.fetch_sub(moved, Ordering::AcqRel) - moved;
        self.store_count(total)?;
        Ok(moved)
    }

    /// Independent non-destructive iterator over the buffered elements.
    pub fn cursor(&self) -> Result<QueueCursor<'_, T, C>, Error> {
        Ok(QueueCursor {
            reader: self.ring.reader()?,
            codec: &self.codec,
            _element: PhantomData,
        })
    }

    /// Buffered element count.
    pub fn size(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Buffered bytes, frames included.
    pub fn buffered_bytes(&self) -> usize {
        self.ring.size()
    }

    pub fn path(&self) -> &Path {
        self.ring.path()
    }

    /// Wakes every wait blocked on the underlying ring with `Interrupted`.
    pub fn interrupt(&self) {
        self.ring.interrupt()
    }

    pub fn close(&self) {
        self.ring.close()
    }
}

/// Iterator over buffered elements that does not consume them. Elements
/// published during iteration are observed; committed ones are not
/// revisited.
pub struct QueueCursor<'a, T, C: Codec<T>> {
    reader: Reader<FileStorage>,
    codec: &'a C,
    _element: PhantomData<fn() -> T>,
}

impl<T, C: Codec<T>> Iterator for QueueCursor<'_, T, C> {
    type Item = Result<T, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.available() < PREFIX_BYTES {
            return None;
        }
        let element = read_prefix(&mut self.reader).and_then(|len| {
            let mut payload = vec![0u8; len];
            read_frame_bytes(&mut self.reader, &mut payload)?;
            self.codec.decode(&payload)
        });
        Some(element)
    }
}

#[cfg(test)]
mod tests {
    use super::ElementQueue;
    use crate::api::codec::StrCodec;
    use crate::core::error::ErrorKind;
    use crate::core::file::FileRingOptions;
    use crate::core::notify::Wait;
    use std::path::Path;

    fn options() -> FileRingOptions {
        FileRingOptions {
            capacity: 256,
            limit: 64 * 1024,
            read_wait: Wait::Never,
            ..FileRingOptions::default()
        }
    }

    fn queue(path: &Path) -> ElementQueue<String, StrCodec> {
        ElementQueue::open(path, StrCodec, options()).expect("open queue")
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn offer_poll_commit_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = queue(&dir.path().join("queue.dat"));

        queue.offer(&strings(&["a", "bb", "ccc"])).expect("offer");
        assert_eq!(queue.size(), 3);

        assert_eq!(queue.poll().expect("poll").as_deref(), Some("a"));
        // Uncommitted: the same element comes back.
        assert_eq!(queue.poll().expect("poll").as_deref(), Some("a"));
        assert_eq!(queue.size(), 3);

        queue.commit().expect("commit");
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.poll().expect("poll").as_deref(), Some("bb"));
        queue.commit().expect("commit");
        assert_eq!(queue.poll().expect("poll").as_deref(), Some("ccc"));
        queue.commit().expect("commit");

        assert_eq!(queue.size(), 0);
        assert_eq!(queue.poll().expect("poll"), None);
        queue.commit().expect("empty commit is a no-op");
    }

    #[test]
    fn count_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.dat");
        {
            let queue = queue(&path);
            queue.offer(&strings(&["x", "y"])).expect("offer");
        }
        let queue = queue(&path);
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.poll().expect("poll").as_deref(), Some("x"));
    }

    #[test]
    fn uncommitted_poll_redelivers_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.dat");
        {
            let queue = queue(&path);
            queue.offer(&strings(&["keep"])).expect("offer");
            assert_eq!(queue.poll().expect("poll").as_deref(), Some("keep"));
            // No commit: the element's bytes stay in the ring.
        }
        let queue = queue(&path);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.poll().expect("poll").as_deref(), Some("keep"));
    }

    #[test]
    fn stored_count_mismatch_heals_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.dat");
        {
            let queue = queue(&path);
            queue.offer(&strings(&["a", "b", "c"])).expect("offer");
        }
        // Corrupt the count slot behind the queue's back.
        let mut contents = std::fs::read(&path).expect("read");
        contents[24..32].copy_from_slice(&99u64.to_le_bytes());
        std::fs::write(&path, &contents).expect("write");

        let queue = queue(&path);
        assert_eq!(queue.size(), 3);
        drop(queue);

        let contents = std::fs::read(&path).expect("read");
        let mut slot = [0u8; 8];
        slot.copy_from_slice(&contents[24..32]);
        assert_eq!(u64::from_le_bytes(slot), 3);
    }

    #[test]
    fn clear_resets_elements_and_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = queue(&dir.path().join("queue.dat"));
        queue.offer(&strings(&["a", "b"])).expect("offer");
        assert_eq!(queue.poll().expect("poll").as_deref(), Some("a"));

        queue.clear().expect("clear");
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.buffered_bytes(), 0);
        assert_eq!(queue.poll().expect("poll"), None);

        queue.offer(&strings(&["fresh"])).expect("offer");
        assert_eq!(queue.poll().expect("poll").as_deref(), Some("fresh"));
    }

    #[test]
    fn transfer_moves_head_elements() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = queue(&dir.path().join("source.dat"));
        let target = queue(&dir.path().join("target.dat"));
        source
            .offer(&strings(&["one", "two", "three"]))
            .expect("offer");

        assert_eq!(source.transfer_to(&target, 2).expect("transfer"), 2);
        assert_eq!(source.size(), 1);
        assert_eq!(target.size(), 2);
        assert_eq!(source.poll().expect("poll").as_deref(), Some("three"));
        assert_eq!(target.poll().expect("poll").as_deref(), Some("one"));

        // Asking for more than is buffered moves what exists.
        source.commit().expect("commit");
        assert_eq!(source.transfer_to(&target, 10).expect("transfer"), 0);
    }

    #[test]
    fn transfer_refused_with_uncommitted_poll() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = queue(&dir.path().join("source.dat"));
        let target = queue(&dir.path().join("target.dat"));
        source.offer(&strings(&["held"])).expect("offer");
        assert_eq!(source.poll().expect("poll").as_deref(), Some("held"));

        let err = source.transfer_to(&target, 1).expect_err("should refuse");
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn cursor_iterates_without_consuming() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = queue(&dir.path().join("queue.dat"));
        queue.offer(&strings(&["a", "b", "c"])).expect("offer");

        let seen: Result<Vec<String>, _> = queue.cursor().expect("cursor").collect();
        assert_eq!(seen.expect("elements"), strings(&["a", "b", "c"]));
        assert_eq!(queue.size(), 3);

        let again: Result<Vec<String>, _> = queue.cursor().expect("cursor").collect();
        assert_eq!(again.expect("elements").len(), 3);
    }

    #[test]
    fn torn_framing_is_rejected_at_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.dat");
        {
            let queue = queue(&path);
            queue.offer(&strings(&["payload"])).expect("offer");
        }
        // Inflate the head prefix so it overruns the buffered bytes.
        let mut contents = std::fs::read(&path).expect("read");
        contents[32..36].copy_from_slice(&1000u32.to_le_bytes());
        std::fs::write(&path, &contents).expect("write");

        let err = ElementQueue::<String, StrCodec>::open(&path, StrCodec, options())
            .expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn undecodable_element_is_dropped_not_stuck() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.dat");
        {
            let queue = queue(&path);
            queue.offer(&strings(&["ok", "aft"])).expect("offer");
        }
        // Corrupt the first payload into invalid UTF-8. The framing stays
        // valid, so the walk still counts two elements.
        let mut contents = std::fs::read(&path).expect("read");
        contents[36..38].copy_from_slice(&[0xff, 0xfe]);
        std::fs::write(&path, &contents).expect("write");

        let queue = queue(&path);
        assert_eq!(queue.size(), 2);
        let err = queue.poll().expect_err("should fail to decode");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.poll().expect("poll").as_deref(), Some("aft"));
    }

    #[test]
    fn failed_transfer_keeps_elements_pollable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = queue(&dir.path().join("source.dat"));
        let target: ElementQueue<String, StrCodec> = ElementQueue::open(
            &dir.path().join("target.dat"),
            StrCodec,
            FileRingOptions {
                capacity: 256,
                limit: 256,
                read_wait: Wait::Never,
                ..FileRingOptions::default()
            },
        )
        .expect("open");

        let big = "x".repeat(300);
        source.offer(&[big.clone()]).expect("offer");

        let err = source.transfer_to(&target, 1).expect_err("should overflow");
        assert_eq!(err.kind(), ErrorKind::Overflow);
        assert_eq!(source.size(), 1);
        assert_eq!(source.poll().expect("poll").as_deref(), Some(big.as_str()));
    }

    #[test]
    fn growth_keeps_elements_intact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = queue(&dir.path().join("queue.dat"));
        let big: Vec<String> = (0..64).map(|i| format!("element-{i:04}")).collect();
        queue.offer(&big).expect("offer");
        assert_eq!(queue.size(), 64);

        for expect in &big {
            assert_eq!(queue.poll().expect("poll").as_deref(), Some(expect.as_str()));
            queue.commit().expect("commit");
        }
        assert!(queue.is_empty());
    }
}

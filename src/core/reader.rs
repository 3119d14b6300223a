//! Purpose: Independent reader streams over a ring.
//! Exports: `Reader`.
//! Role: Copies published bytes without holding the engine lock, then
//! validates the copy against the generation and the eviction head.
//! Invariants: A committed read never returns bytes from a torn copy; a
//! reader overtaken by eviction reports `FellBehind` instead of data loss.

use std::io;
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::ring::{fell_behind, Shared};
use crate::core::storage::Storage;

/// Byte source over a ring. Each reader keeps its own cursor and does not
/// consume: bytes leave the ring only through eviction. Obtain one through
/// [`Ring::reader`](crate::core::ring::Ring::reader).
///
/// Reads are optimistic: the bytes are copied with no lock held, then the
/// cursor advance is committed only if nothing relocated or evicted the
/// copied range in the meantime. A failed validation retries invisibly.
#[derive(Debug)]
pub struct Reader<S: Storage> {
    shared: Arc<Shared<S>>,
    id: u64,
}

impl<S: Storage> Reader<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>, id: u64) -> Self {
        Self { shared, id }
    }

    /// Copies up to `buf.len()` bytes that are available right now and
    /// returns the count, `Ok(0)` when nothing is published past the
    /// cursor. Never blocks.
    pub fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let snapshot = self.shared.snapshot(self.id)?;
            let Some(available) = snapshot.state.available_to_read(&snapshot.position) else {
                return Err(fell_behind());
            };
            let len = buf.len().min(available);
            if len == 0 {
                return Ok(0);
            }
            let mut copy_error = None;
            for span in snapshot.position.spans(len) {
                let slice = &mut buf[span.buf_offset..span.buf_offset + span.len];
                if let Err(err) = snapshot.storage.read_at(span.ring_offset, slice) {
                    copy_error = Some(err);
                    break;
                }
            }
            if let Some(err) = copy_error {
                // A relocation may have shrunk the store under the copy.
                if self.shared.is_stale(&snapshot) {
                    continue;
                }
                return Err(err);
            }
            if self.shared.commit_read(self.id, &snapshot, len)? {
                return Ok(len);
            }
        }
    }

    /// The next byte, blocking per the ring's read policy. `Ok(None)` when
    /// the policy gives up before data arrives.
    pub fn read_byte(&mut self) -> Result<Option<u8>, Error> {
        loop {
            match self.shared.wait_readable(self.id) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Timeout => return Ok(None),
                Err(err) => return Err(err),
            }
            let mut byte = [0u8; 1];
            if self.try_read(&mut byte)? == 1 {
                return Ok(Some(byte[0]));
            }
        }
    }

    /// Advances the cursor past up to `len` available bytes and returns
    /// the count actually skipped. Never blocks.
    pub fn skip(&mut self, len: usize) -> Result<usize, Error> {
        self.shared.skip(self.id, len)
    }

    /// Published bytes between the cursor and the write position.
    pub fn available(&self) -> usize {
        self.shared.available(self.id)
    }

    /// Blocks per the ring's read policy until at least one byte is
    /// available, then returns the available count.
    pub fn wait_readable(&mut self) -> Result<usize, Error> {
        self.shared.wait_readable(self.id)
    }
}

impl<S: Storage> io::Read for Reader<S> {
    /// Blocking read per the ring's read policy. A closed ring reads as
    /// end of file; an overtaken cursor surfaces as an error.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.try_read(buf) {
                Ok(0) => {}
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::Closed => return Ok(0),
                Err(err) => return Err(err.into()),
            }
            match self.shared.wait_readable(self.id) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Closed => return Ok(0),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl<S: Storage> Drop for Reader<S> {
    fn drop(&mut self) {
        self.shared.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use crate::core::ring::{Ring, RingOptions};

    fn ring() -> Ring<crate::core::storage::MemoryStorage> {
        Ring::in_memory(RingOptions {
            capacity: 16,
            limit: 64,
            ..RingOptions::default()
        })
        .expect("ring")
    }

    #[test]
    fn cursor_does_not_consume() {
        let ring = ring();
        let mut writer = ring.writer().expect("writer");
        writer.write(b"hello").expect("write");
        writer.flush().expect("flush");

        let mut first = ring.reader().expect("reader");
        let mut second = ring.reader().expect("reader");
        let mut buf = [0u8; 8];
        assert_eq!(first.try_read(&mut buf).expect("read"), 5);
        assert_eq!(second.try_read(&mut buf).expect("read"), 5);
        assert_eq!(ring.size(), 5);
        assert_eq!(first.available(), 0);
    }

    #[test]
    fn skip_clamps_to_available() {
        let ring = ring();
        let mut writer = ring.writer().expect("writer");
        writer.write(b"abc").expect("write");
        writer.flush().expect("flush");

        let mut reader = ring.reader().expect("reader");
        assert_eq!(reader.skip(10).expect("skip"), 3);
        assert_eq!(reader.available(), 0);
    }

    #[test]
    fn closed_ring_reads_as_eof() {
        use std::io::Read;

        let ring = ring();
        let mut writer = ring.writer().expect("writer");
        writer.write(b"tail").expect("write");
        writer.flush().expect("flush");
        drop(writer);

        let mut reader = ring.reader().expect("reader");
        ring.close();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).expect("read"), 0);
    }

    #[test]
    fn dropping_a_reader_frees_its_slot() {
        let ring = ring();
        let reader = ring.reader().expect("reader");
        assert_eq!(ring.info().readers, 1);
        drop(reader);
        assert_eq!(ring.info().readers, 0);
    }

    #[test]
    fn try_read_with_empty_buffer() {
        let ring = ring();
        let mut writer = ring.writer().expect("writer");
        writer.write(b"x").expect("write");
        writer.flush().expect("flush");

        let mut reader = ring.reader().expect("reader");
        assert_eq!(reader.try_read(&mut []).expect("read"), 0);
        assert_eq!(reader.available(), 1);
    }
}

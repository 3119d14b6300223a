//! Purpose: The single writer stream over a ring.
//! Exports: `Writer`.
//! Role: Stages bytes into unpublished tail space; `flush` makes them
//! visible to readers in one step.
//! Invariants: Staged bytes live past the published range and are never
//! observed by readers. Dropping the stream flushes what it can and frees
//! the writer slot.

use std::io;
use std::sync::Arc;

use tracing::warn;

use crate::core::error::Error;
use crate::core::ring::Shared;
use crate::core::storage::Storage;

/// Byte sink for a ring. At most one exists per ring at a time; obtain it
/// through [`Ring::writer`](crate::core::ring::Ring::writer).
///
/// Bytes passed to [`write`](Writer::write) are staged: they occupy ring
/// space immediately (growing the ring if needed) but stay invisible to
/// readers and to `size()` until [`flush`](Writer::flush) publishes them.
#[derive(Debug)]
pub struct Writer<S: Storage> {
    shared: Arc<Shared<S>>,
    staged: usize,
}

impl<S: Storage> Writer<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>) -> Self {
        Self { shared, staged: 0 }
    }

    /// Stages `bytes` after any previously staged bytes. Blocks or fails
    /// per the ring's write policy when the needed space exceeds the
    /// growth limit.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        let (storage, position) = self.shared.prepare_write(self.staged, bytes.len())?;
        for span in position.spans(bytes.len()) {
            storage.write_at(
                span.ring_offset,
                &bytes[span.buf_offset..span.buf_offset + span.len],
            )?;
        }
        self.staged += bytes.len();
        Ok(())
    }

    /// Publishes everything staged so far. A no-op when nothing is staged.
    pub fn flush(&mut self) -> Result<(), Error> {
        let staged = std::mem::take(&mut self.staged);
        self.shared.publish(staged)
    }

    /// Bytes written but not yet published.
    pub fn staged(&self) -> usize {
        self.staged
    }
}

impl<S: Storage> io::Write for Writer<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Writer::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Writer::flush(self)?;
        Ok(())
    }
}

impl<S: Storage> Drop for Writer<S> {
    fn drop(&mut self) {
        if self.staged > 0 {
            if let Err(err) = self.flush() {
                warn!(error = %err, "writer dropped with unpublished bytes");
            }
        }
        self.shared.release_writer();
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
    fn drop_publishes_staged_bytes() {
        let ring = ring();
        let mut writer = ring.writer().expect("writer");
        writer.write(b"staged").expect("write");
        assert_eq!(writer.staged(), 6);
        assert_eq!(ring.size(), 0);
        drop(writer);
        assert_eq!(ring.size(), 6);
    }

    #[test]
    fn io_write_trait_stages_and_flushes() {
        use std::io::Write;

        let ring = ring();
        let mut writer = ring.writer().expect("writer");
        writer.write_all(b"via io").expect("write_all");
        assert_eq!(ring.size(), 0);
        Write::flush(&mut writer).expect("flush");
        assert_eq!(ring.size(), 6);
    }

    #[test]
    fn empty_write_is_a_no_op() {
        let ring = ring();
        let mut writer = ring.writer().expect("writer");
        writer.write(&[]).expect("write");
        assert_eq!(writer.staged(), 0);
        writer.flush().expect("flush");
        assert_eq!(ring.size(), 0);
    }
}

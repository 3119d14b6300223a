//! Purpose: A directory of element queues acting as one partitioned queue.
//! Exports: `PartitionedQueues`, `PartitionsCursor`.
//! Role: Spreads offers so partition loads approach the mean, and
//! repartitions on resize by transferring doomed partitions into the
//! survivors before deleting their files.
//! Invariants: Partition files are named `partition-<n>.dat`; unrelated
//! files in the directory are left alone.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::api::codec::Codec;
use crate::api::queue::{ElementQueue, QueueCursor};
use crate::core::error::{Error, ErrorKind};
use crate::core::file::FileRingOptions;

fn partition_file_name(index: usize) -> String {
    format!("partition-{index}.dat")
}

fn parse_partition_index(name: &str) -> Option<usize> {
    name.strip_prefix("partition-")?
        .strip_suffix(".dat")?
        .parse()
        .ok()
}

struct Partition<T, C: Codec<T>> {
    index: usize,
    path: PathBuf,
    queue: Arc<ElementQueue<T, C>>,
}

/// Element queues sharded over `partition-<n>.dat` files in one
/// directory, presented as a single queue. Offers spread toward the mean
/// partition load; [`resize`](PartitionedQueues::resize) changes the
/// partition count without losing elements.
pub struct PartitionedQueues<T, C: Codec<T>> {
    dir: PathBuf,
    codec: C,
    options: FileRingOptions,
    partitions: Vec<Partition<T, C>>,
    next_poll: AtomicUsize,
}

// Opening and resizing mint new partitions and need to clone the codec;
// everything else works with whatever partitions already exist.
impl<T, C: Codec<T> + Clone> PartitionedQueues<T, C> {
    /// Creates the directory if needed and loads every partition file in
    /// it. A fresh directory starts with no partitions; call
    /// [`resize`](PartitionedQueues::resize) to create some.
    pub fn open(dir: impl AsRef<Path>, codec: C, options: FileRingOptions) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("cannot create queue directory")
                .with_path(&dir)
                .with_source(err)
        })?;
        let entries = fs::read_dir(&dir).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("cannot scan queue directory")
                .with_path(&dir)
                .with_source(err)
        })?;
        let mut partitions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("cannot scan queue directory")
                    .with_path(&dir)
                    .with_source(err)
            })?;
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(parse_partition_index) else {
                continue;
            };
            let path = entry.path();
            let queue = ElementQueue::open(&path, codec.clone(), options)?;
            partitions.push(Partition {
                index,
                path,
                queue: Arc::new(queue),
            });
        }
        partitions.sort_by_key(|partition| partition.index);
        debug!(dir = %dir.display(), partitions = partitions.len(), "opened partitioned queues");
        Ok(Self {
            dir,
            codec,
            options,
            partitions,
            next_poll: AtomicUsize::new(0),
        })
    }

    /// Changes the partition count. Growing creates empty partitions for
    /// the missing indices below `count`. Shrinking first spreads each
    /// doomed partition's elements over the survivors, then deletes its
    /// file.
    pub fn resize(&mut self, count: usize) -> Result<(), Error> {
        for index in 0..count {
            if self.partitions.iter().any(|partition| partition.index == index) {
                continue;
            }
            let path = self.dir.join(partition_file_name(index));
            let queue = ElementQueue::open(&path, self.codec.clone(), self.options)?;
            self.partitions.push(Partition {
                index,
                path,
                queue: Arc::new(queue),
            });
        }
        self.partitions.sort_by_key(|partition| partition.index);

        let doomed: Vec<Partition<T, C>> = {
            let mut keep = Vec::new();
            let mut doomed = Vec::new();
            for partition in self.partitions.drain(..) {
                if partition.index < count {
                    keep.push(partition);
                } else {
                    doomed.push(partition);
                }
            }
            self.partitions = keep;
            doomed
        };
        for partition in doomed {
            self.drain_into_survivors(&partition)?;
            partition.queue.close();
            drop(partition.queue);
            fs::remove_file(&partition.path).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("cannot delete emptied partition file")
                    .with_path(&partition.path)
                    .with_source(err)
            })?;
            debug!(path = %partition.path.display(), "deleted partition");
        }
        Ok(())
    }
}

impl<T, C: Codec<T>> PartitionedQueues<T, C> {
    /// Total buffered elements across partitions.
    pub fn size(&self) -> u64 {
        self.partitions
            .iter()
            .map(|partition| partition.queue.size())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn partition_queues(&self) -> Vec<(usize, Arc<ElementQueue<T, C>>)> {
        self.partitions
            .iter()
            .map(|partition| (partition.index, partition.queue.clone()))
            .collect()
    }

    /// Appends `elements`, filling the least-loaded partitions first so
    /// every partition's count approaches the post-insert average.
    pub fn offer(&self, elements: &[T]) -> Result<(), Error> {
        if elements.is_empty() {
            return Ok(());
        }
        if self.partitions.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("queue directory has no partitions; resize it first")
                .with_path(&self.dir));
        }
        let mut loads: Vec<(u64, &Partition<T, C>)> = self
            .partitions
            .iter()
            .map(|partition| (partition.queue.size(), partition))
            .collect();
        loads.sort_by_key(|(size, _)| *size);
        let total: u64 = loads.iter().map(|(size, _)| size).sum::<u64>() + elements.len() as u64;
        let average = total.div_ceil(self.partitions.len() as u64);
        let mut cursor = 0usize;
        for (size, partition) in loads {
            if cursor == elements.len() {
                break;
            }
            let room = usize::try_from(average.saturating_sub(size)).unwrap_or(usize::MAX);
            let take = room.min(elements.len() - cursor);
            if take == 0 {
                continue;
            }
            partition.queue.offer(&elements[cursor..cursor + take])?;
            cursor += take;
        }
        debug_assert_eq!(cursor, elements.len());
        Ok(())
    }

    /// Polls the partitions round-robin and returns the first element
    /// found with its partition index, or `Ok(None)` when every partition
    /// is empty. Never blocks. Commit through
    /// [`commit`](PartitionedQueues::commit) with the returned index.
    /// Meant for a single consumer; concurrent callers can observe the
    /// same uncommitted element.
    pub fn poll_any(&self) -> Result<Option<(usize, T)>, Error>
    where
        T: Clone,
    {
        if self.partitions.is_empty() {
            return Ok(None);
        }
        let start = self.next_poll.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        for step in 0..self.partitions.len() {
            let partition = &self.partitions[(start + step) % self.partitions.len()];
            if partition.queue.buffered_bytes() == 0 {
                continue;
            }
            if let Some(element) = partition.queue.poll()? {
                return Ok(Some((partition.index, element)));
            }
        }
        Ok(None)
    }

    /// Commits the last element polled from partition `index`.
    pub fn commit(&self, index: usize) -> Result<(), Error> {
        let partition = self
            .partitions
            .iter()
            .find(|partition| partition.index == index)
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("no partition with index {index}"))
                    .with_path(&self.dir)
            })?;
        partition.queue.commit()
    }

    fn drain_into_survivors(&self, doomed: &Partition<T, C>) -> Result<(), Error> {
        let mut remaining = doomed.queue.size();
        while remaining > 0 {
            if self.partitions.is_empty() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("cannot drop every partition while elements remain")
                    .with_path(&self.dir));
            }
            let target = self
                .partitions
                .iter()
                .min_by_key(|partition| partition.queue.size())
                .ok_or_else(|| {
                    Error::new(ErrorKind::Usage).with_message("no surviving partition")
                })?;
            let survivor_total: u64 = self
                .partitions
                .iter()
                .map(|partition| partition.queue.size())
                .sum();
            let average = (survivor_total + remaining).div_ceil(self.partitions.len() as u64);
            let take = average
                .saturating_sub(target.queue.size())
                .max(1)
                .min(remaining);
            let moved = doomed.queue.transfer_to(&target.queue, take)?;
            if moved == 0 {
                break;
            }
            remaining -= moved;
        }
        Ok(())
    }

    /// Chains the partitions' non-destructive cursors in index order.
    pub fn cursor(&self) -> Result<PartitionsCursor<'_, T, C>, Error> {
        let mut cursors = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            cursors.push(partition.queue.cursor()?);
        }
        Ok(PartitionsCursor {
            cursors,
            current: 0,
        })
    }

    /// Wakes every wait blocked on any partition with `Interrupted`.
    pub fn interrupt_all(&self) {
        for partition in &self.partitions {
            partition.queue.interrupt();
        }
    }

    pub fn close_all(&self) {
        for partition in &self.partitions {
            partition.queue.close();
        }
    }
}

/// Cursor over every partition's buffered elements, in partition order.
pub struct PartitionsCursor<'a, T, C: Codec<T>> {
    cursors: Vec<QueueCursor<'a, T, C>>,
    current: usize,
}

impl<T, C: Codec<T>> Iterator for PartitionsCursor<'_, T, C> {
    type Item = Result<T, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current < self.cursors.len() {
            if let Some(item) = self.cursors[self.current].next() {
                return Some(item);
            }
            self.current += 1;
        }
        None
    }
}

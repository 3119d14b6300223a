//! Purpose: Background workers that drain partitioned queues through a handler.
//! Exports: `PollingExecutor`, `ExecutorStats`, `ExecutorStatus`.
//! Role: Owns one worker thread per partition; each worker loops
//! poll, handle, commit so an element is redelivered after a crash only
//! if its commit never ran.
//! Invariants: Handler failures are logged and counted, then the element
//! is committed anyway so one poison element cannot wedge a partition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::api::codec::Codec;
use crate::api::queue::ElementQueue;
use crate::api::queues::PartitionedQueues;
use crate::core::error::{Error, ErrorKind};

const STARTING: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// How long `stop` sleeps between interrupt nudges while workers wind down.
const STOP_NUDGE: Duration = Duration::from_millis(5);

/// Pause after an empty poll so non-blocking read policies do not spin hot.
const IDLE_NAP: Duration = Duration::from_millis(1);

/// Lifecycle of a [`PollingExecutor`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutorStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

fn decode_status(raw: u8) -> ExecutorStatus {
    match raw {
        STARTING => ExecutorStatus::Starting,
        RUNNING => ExecutorStatus::Running,
        STOPPING => ExecutorStatus::Stopping,
        _ => ExecutorStatus::Stopped,
    }
}

/// Counter snapshot; `polled == handled + failed` once the workers are
/// quiescent.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecutorStats {
    pub polled: u64,
    pub handled: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    polled: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            polled: self.polled.load(Ordering::Acquire),
            handled: self.handled.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }
}

type Handler<T> = Arc<dyn Fn(T) -> Result<(), Error> + Send + Sync>;

/// Fixed pool of worker threads, one per queue partition, each feeding
/// polled elements to a shared handler and committing afterwards.
pub struct PollingExecutor<T, C: Codec<T>> {
    queues: Arc<PartitionedQueues<T, C>>,
    workers: Vec<JoinHandle<()>>,
    status: Arc<AtomicU8>,
    counters: Arc<Counters>,
}

impl<T, C> PollingExecutor<T, C>
where
    T: Clone + Send + 'static,
    C: Codec<T> + Clone + Send + Sync + 'static,
{
    /// Resizes `queues` to `concurrency` partitions and spawns one worker
    /// per partition. Returns once every worker is running.
    pub fn start<F>(
        mut queues: PartitionedQueues<T, C>,
        concurrency: usize,
        handler: F,
    ) -> Result<Self, Error>
    where
        F: Fn(T) -> Result<(), Error> + Send + Sync + 'static,
    {
        if concurrency == 0 {
            return Err(
                Error::new(ErrorKind::Usage).with_message("concurrency must be at least one")
            );
        }
        queues.resize(concurrency)?;
        let queues = Arc::new(queues);
        let status = Arc::new(AtomicU8::new(STARTING));
        let counters = Arc::new(Counters::default());
        let handler: Handler<T> = Arc::new(handler);

        let partitions = queues.partition_queues();
        let mut workers = Vec::with_capacity(partitions.len());
        for (index, queue) in partitions {
            let spawn = thread::Builder::new()
                .name(format!("queue-worker-{index}"))
                .spawn({
                    let status = Arc::clone(&status);
                    let counters = Arc::clone(&counters);
                    let handler = Arc::clone(&handler);
                    move || worker_loop(index, queue, handler, status, counters)
                });
            match spawn {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    status.store(STOPPING, Ordering::Release);
                    nudge_join(&queues, workers);
                    return Err(Error::new(ErrorKind::Io)
                        .with_message("cannot spawn queue worker")
                        .with_source(err));
                }
            }
        }
        status.store(RUNNING, Ordering::Release);
        debug!(workers = workers.len(), "executor running");
        Ok(Self {
            queues,
            workers,
            status,
            counters,
        })
    }
}

impl<T, C: Codec<T>> PollingExecutor<T, C> {
    pub fn status(&self) -> ExecutorStatus {
        decode_status(self.status.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    pub fn queues(&self) -> &PartitionedQueues<T, C> {
        &self.queues
    }

    /// Enqueues elements for the workers. Refused once the executor has
    /// begun stopping.
    pub fn submit(&self, elements: &[T]) -> Result<(), Error> {
        if self.status.load(Ordering::Acquire) != RUNNING {
            return Err(Error::new(ErrorKind::Closed).with_message("executor is not running"));
        }
        self.queues.offer(elements)
    }

    /// Stops the workers and waits for them to finish. A worker that is
    /// mid-handle completes and commits its element first. Returns the
    /// final counters. Calling `stop` again is a no-op.
    pub fn stop(&mut self) -> ExecutorStats {
        self.status.store(STOPPING, Ordering::Release);
        nudge_join(&self.queues, std::mem::take(&mut self.workers));
        self.status.store(STOPPED, Ordering::Release);
        self.counters.snapshot()
    }
}

impl<T, C: Codec<T>> Drop for PollingExecutor<T, C> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}

// A worker can re-enter a blocking poll after `interrupt_all` has already
// fired, so the joiner keeps nudging until the thread is actually gone.
fn nudge_join<T, C: Codec<T>>(queues: &PartitionedQueues<T, C>, workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        while !worker.is_finished() {
            queues.interrupt_all();
            thread::sleep(STOP_NUDGE);
        }
        if worker.join().is_err() {
            error!("queue worker panicked");
        }
    }
}

fn worker_loop<T: Clone, C: Codec<T>>(
    index: usize,
    queue: Arc<ElementQueue<T, C>>,
    handler: Handler<T>,
    status: Arc<AtomicU8>,
    counters: Arc<Counters>,
) {
    debug!(partition = index, "worker started");
    loop {
        if status.load(Ordering::Acquire) >= STOPPING {
            break;
        }
        let element = match queue.poll() {
            Ok(Some(element)) => element,
            Ok(None) => {
                thread::sleep(IDLE_NAP);
                continue;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::Closed => break,
            Err(err) if err.kind() == ErrorKind::Corrupt => {
                // The queue evicts a frame it cannot decode, so the
                // partition is still consistent after this error.
                counters.polled.fetch_add(1, Ordering::AcqRel);
                counters.failed.fetch_add(1, Ordering::AcqRel);
                warn!(partition = index, error = %err, "undecodable element dropped");
                continue;
            }
            Err(err) => {
                error!(partition = index, error = %err, "worker poll failed");
                break;
            }
        };
        counters.polled.fetch_add(1, Ordering::AcqRel);
        match handler(element) {
            Ok(()) => {
                counters.handled.fetch_add(1, Ordering::AcqRel);
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::AcqRel);
                warn!(partition = index, error = %err, "element handler failed; element skipped");
            }
        }
        if let Err(err) = queue.commit() {
            error!(partition = index, error = %err, "worker commit failed");
            break;
        }
    }
    debug!(partition = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::{ExecutorStatus, PollingExecutor};
    use crate::api::codec::StrCodec;
    use crate::api::queues::PartitionedQueues;
    use crate::core::error::{Error, ErrorKind};
    use crate::core::file::FileRingOptions;
    use crate::core::notify::Wait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    fn open_queues(dir: &Path, read_wait: Wait) -> PartitionedQueues<String, StrCodec> {
        let options = FileRingOptions {
            capacity: 256,
            limit: 64 * 1024,
            read_wait,
            ..FileRingOptions::default()
        };
        PartitionedQueues::open(dir, StrCodec, options).expect("open queues")
    }

    fn elements(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("job-{i:03}")).collect()
    }

    fn wait_until(limit: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if ready() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        ready()
    }

    #[test]
    fn zero_concurrency_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queues = open_queues(dir.path(), Wait::Never);
        let err = PollingExecutor::start(queues, 0, |_: String| Ok(()))
            .err()
            .expect("should refuse");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn processes_every_submitted_element() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queues = open_queues(dir.path(), Wait::For(Duration::from_millis(20)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut executor = PollingExecutor::start(queues, 2, move |element: String| {
            sink.lock().unwrap().push(element);
            Ok(())
        })
        .expect("start");
        assert_eq!(executor.status(), ExecutorStatus::Running);

        executor.submit(&elements(12)).expect("submit");
        assert!(
            wait_until(Duration::from_secs(5), || executor.queues().is_empty()),
            "workers did not drain the queues"
        );

        let stats = executor.stop();
        assert_eq!(executor.status(), ExecutorStatus::Stopped);
        assert_eq!(stats.polled, 12);
        assert_eq!(stats.handled, 12);
        assert_eq!(stats.failed, 0);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, elements(12));
    }

    #[test]
    fn handler_failures_are_counted_and_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queues = open_queues(dir.path(), Wait::For(Duration::from_millis(20)));

        let mut executor = PollingExecutor::start(queues, 1, |element: String| {
            if element.contains("bad") {
                Err(Error::new(ErrorKind::Usage).with_message("rejected"))
            } else {
                Ok(())
            }
        })
        .expect("start");

        let batch = vec![
            "ok-1".to_string(),
            "bad-1".to_string(),
            "ok-2".to_string(),
            "bad-2".to_string(),
        ];
        executor.submit(&batch).expect("submit");
        assert!(
            wait_until(Duration::from_secs(5), || executor.queues().is_empty()),
            "poison elements wedged the worker"
        );

        let stats = executor.stop();
        assert_eq!(stats.polled, 4);
        assert_eq!(stats.handled, 2);
        assert_eq!(stats.failed, 2);
    }

    #[test]
    fn stop_wakes_workers_blocked_on_empty_partitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queues = open_queues(dir.path(), Wait::Forever);
        let mut executor =
            PollingExecutor::start(queues, 2, |_: String| Ok(())).expect("start");
        // Workers are parked in a forever wait; stop must still return.
        let stats = executor.stop();
        assert_eq!(stats.polled, 0);
        assert_eq!(executor.status(), ExecutorStatus::Stopped);
    }

    #[test]
    fn submit_after_stop_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queues = open_queues(dir.path(), Wait::Never);
        let mut executor =
            PollingExecutor::start(queues, 1, |_: String| Ok(())).expect("start");
        executor.stop();
        let err = executor
            .submit(&elements(1))
            .expect_err("submit should be refused");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}

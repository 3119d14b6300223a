// Library-level stream, persistence and pipeline tests.
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use ringfile::api::{
    FileRing, FileRingOptions, JsonCodec, PartitionedQueues, PollingExecutor, Wait,
};

const STREAM_TOTAL: usize = 1 << 20;
const CHUNK: usize = 1000;

fn pattern_chunk(index: usize, buf: &mut [u8]) {
    for (offset, byte) in buf.iter_mut().enumerate() {
        *byte = ((index * CHUNK + offset) % 251) as u8;
    }
}

#[test]
fn concurrent_drain_matches_the_written_stream() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("stream.ring");
    let ring = FileRing::open(
        &path,
        FileRingOptions {
            capacity: 4 * 1024,
            limit: 8 * 1024,
            write_wait: Wait::Forever,
            read_wait: Wait::Forever,
            ..FileRingOptions::default()
        },
    )
    .expect("open");

    let (sent, received) = thread::scope(|scope| {
        let producer = scope.spawn(|| {
            let mut writer = ring.writer().expect("writer");
            let mut digest = Sha256::new();
            let mut chunk = [0u8; CHUNK];
            let mut index = 0;
            let mut total = 0usize;
            while total < STREAM_TOTAL {
                let len = CHUNK.min(STREAM_TOTAL - total);
                pattern_chunk(index, &mut chunk[..len]);
                writer.write(&chunk[..len]).expect("write");
                writer.flush().expect("flush");
                digest.update(&chunk[..len]);
                total += len;
                index += 1;
            }
            digest.finalize()
        });

        // The consumer evicts only bytes it already copied out, so its
        // cursor can never fall behind the head.
        let mut reader = ring.reader().expect("reader");
        let mut digest = Sha256::new();
        let mut buf = vec![0u8; 4 * 1024];
        let mut total = 0usize;
        while total < STREAM_TOTAL {
            let n = reader.read(&mut buf).expect("read");
            assert!(n > 0, "stream ended {total} bytes early");
            digest.update(&buf[..n]);
            ring.remove(n).expect("remove");
            total += n;
        }
        (producer.join().expect("producer"), digest.finalize())
    });

    assert_eq!(sent, received);
    assert_eq!(ring.size(), 0);
}

#[test]
fn reopened_ring_resumes_with_its_buffered_tail() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("resume.ring");
    let options = FileRingOptions {
        capacity: 4 * 1024,
        limit: 4 * 1024,
        read_wait: Wait::Never,
        ..FileRingOptions::default()
    };

    let payload: Vec<u8> = (0..5500).map(|i| (i % 239) as u8).collect();
    {
        let ring = FileRing::open(&path, options).expect("open");
        let mut writer = ring.writer().expect("writer");
        writer.write(&payload[..3000]).expect("write");
        writer.flush().expect("flush");
        ring.remove(2000).expect("remove");
        // The second batch wraps the write position past the end.
        writer.write(&payload[3000..]).expect("write");
        writer.flush().expect("flush");
        drop(writer);
        ring.close();
    }

    let header = FileRing::inspect(&path).expect("inspect");
    assert_eq!(header.size, 3500);
    assert!(header.wrapped);

    let ring = FileRing::open(&path, options).expect("reopen");
    let mut reader = ring.reader().expect("reader");
    let mut buf = vec![0u8; 4096];
    let mut got = Vec::new();
    loop {
        let n = reader.try_read(&mut buf).expect("read");
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, &payload[2000..]);
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct Job {
    id: u32,
    label: String,
}

#[test]
fn executor_processes_jobs_across_partitions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queues = PartitionedQueues::open(
        temp.path().join("jobs"),
        JsonCodec,
        FileRingOptions {
            capacity: 1024,
            limit: 64 * 1024,
            read_wait: Wait::For(Duration::from_millis(20)),
            ..FileRingOptions::default()
        },
    )
    .expect("open");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut executor = PollingExecutor::start(queues, 3, move |job: Job| {
        sink.lock().expect("lock").push(job.id);
        Ok(())
    })
    .expect("start");

    let jobs: Vec<Job> = (0..40)
        .map(|id| Job {
            id,
            label: format!("job-{id}"),
        })
        .collect();
    executor.submit(&jobs).expect("submit");

    let deadline = Instant::now() + Duration::from_secs(5);
    while executor.stats().handled < 40 {
        assert!(Instant::now() < deadline, "stalled: {:?}", executor.stats());
        thread::sleep(Duration::from_millis(10));
    }
    let stats = executor.stop();
    assert_eq!(stats.handled, 40);
    assert_eq!(stats.failed, 0);

    let mut ids = Arc::try_unwrap(seen)
        .expect("handlers done")
        .into_inner()
        .expect("lock");
    ids.sort_unstable();
    let expected: Vec<u32> = (0..40).collect();
    assert_eq!(ids, expected);
}

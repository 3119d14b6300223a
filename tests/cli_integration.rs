// CLI integration tests for the ring file commands.
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_ringfile");
    Command::new(exe)
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

fn info_json(ring: &str) -> Value {
    let info = cmd()
        .args(["info", ring, "--json"])
        .output()
        .expect("info");
    assert!(info.status.success());
    parse_json(std::str::from_utf8(&info.stdout).expect("utf8"))
}

fn send_sigint(child: &Child) {
    // The pid belongs to a child this test spawned and still owns.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGINT);
    }
}

#[test]
fn create_feed_drain_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ring = temp.path().join("events.ring");
    let ring = ring.to_str().unwrap();

    let create = cmd()
        .args(["create", ring, "--capacity", "4K", "--limit", "64K"])
        .output()
        .expect("create");
    assert!(create.status.success());
    let text = String::from_utf8_lossy(&create.stdout);
    assert!(text.contains("capacity 4K"), "{text}");

    let feed = cmd()
        .args(["feed", ring, "hello from the cli"])
        .output()
        .expect("feed");
    assert!(feed.status.success());

    let info = info_json(ring);
    assert_eq!(info["capacity"].as_u64().unwrap(), 4096);
    assert_eq!(info["size"].as_u64().unwrap(), 19);
    assert!(!info["wrapped"].as_bool().unwrap());
    assert!(info["modified"].as_str().is_some());

    let drain = cmd().args(["drain", ring]).output().expect("drain");
    assert!(drain.status.success());
    assert_eq!(drain.stdout, b"hello from the cli\n");

    assert_eq!(info_json(ring)["size"].as_u64().unwrap(), 0);
}

#[test]
fn feed_reads_stdin_to_end() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ring = temp.path().join("pipe.ring");
    let ring = ring.to_str().unwrap();

    let create = cmd().args(["create", ring]).output().expect("create");
    assert!(create.status.success());

    let mut feed = cmd()
        .args(["feed", ring])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .expect("spawn feed");
    feed.stdin
        .as_mut()
        .expect("stdin")
        .write_all(b"line one\nline two\n")
        .expect("write");
    drop(feed.stdin.take());
    assert!(feed.wait().expect("wait").success());

    let drain = cmd().args(["drain", ring]).output().expect("drain");
    assert!(drain.status.success());
    assert_eq!(drain.stdout, b"line one\nline two\n");
}

#[test]
fn create_refuses_existing_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ring = temp.path().join("dup.ring");
    let ring = ring.to_str().unwrap();

    assert!(cmd().args(["create", ring]).output().expect("create").status.success());

    let again = cmd().args(["create", ring]).output().expect("create");
    assert_eq!(again.status.code(), Some(2));
}

#[test]
fn missing_file_reports_io_error_as_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    let absent = temp.path().join("absent.ring");

    let info = cmd()
        .args(["info", absent.to_str().unwrap()])
        .output()
        .expect("info");
    assert_eq!(info.status.code(), Some(12));

    // stderr is not a terminal here, so the error comes out as JSON.
    let stderr = String::from_utf8_lossy(&info.stderr);
    let line = stderr.lines().next().expect("stderr line");
    let err = parse_json(line);
    assert_eq!(err["error"]["kind"].as_str().unwrap(), "Io");
    assert!(err["error"]["message"].as_str().unwrap().contains("cannot open"));
}

#[test]
fn drain_follow_interleaves_with_feeds() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ring = temp.path().join("follow.ring");
    let ring = ring.to_str().unwrap();

    assert!(cmd().args(["create", ring]).output().expect("create").status.success());
    assert!(cmd()
        .args(["feed", ring, "first batch"])
        .output()
        .expect("feed")
        .status
        .success());

    let mut drain = cmd()
        .args(["drain", ring, "--follow"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn drain");
    sleep(Duration::from_millis(800));

    // The follower releases the lock between polls; this feed retries
    // until it wins the race.
    assert!(cmd()
        .args(["feed", ring, "second batch"])
        .output()
        .expect("feed")
        .status
        .success());
    sleep(Duration::from_millis(800));

    send_sigint(&drain);
    let output = drain.wait_with_output().expect("wait");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(output.stdout, b"first batch\nsecond batch\n");

    assert_eq!(info_json(ring)["size"].as_u64().unwrap(), 0);
}

#[test]
fn watch_prints_without_consuming() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ring = temp.path().join("watch.ring");
    let ring = ring.to_str().unwrap();

    assert!(cmd().args(["create", ring]).output().expect("create").status.success());

    let mut watch = cmd()
        .args(["watch", ring])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn watch");
    sleep(Duration::from_millis(500));

    assert!(cmd()
        .args(["feed", ring, "tick one"])
        .output()
        .expect("feed")
        .status
        .success());
    sleep(Duration::from_millis(800));

    send_sigint(&watch);
    let output = watch.wait_with_output().expect("wait");
    assert_eq!(output.status.code(), Some(0));
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("tick one"), "{text}");
    // Chunks are prefixed with an RFC 3339 timestamp.
    let first = text.lines().next().expect("line");
    assert!(first.contains('T') && first.contains("  "), "{first}");

    // Watching evicts nothing.
    assert_eq!(info_json(ring)["size"].as_u64().unwrap(), 9);
}

#[test]
fn shrink_reclaims_capacity() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ring = temp.path().join("big.ring");
    let ring = ring.to_str().unwrap();

    assert!(cmd()
        .args(["create", ring, "--capacity", "64K"])
        .output()
        .expect("create")
        .status
        .success());
    assert!(cmd()
        .args(["feed", ring, "a little data"])
        .output()
        .expect("feed")
        .status
        .success());
    assert_eq!(info_json(ring)["capacity"].as_u64().unwrap(), 65536);

    let shrink = cmd().args(["shrink", ring]).output().expect("shrink");
    assert!(shrink.status.success());
    let text = String::from_utf8_lossy(&shrink.stdout);
    assert!(text.contains("shrank"), "{text}");

    let info = info_json(ring);
    assert_eq!(info["capacity"].as_u64().unwrap(), 4096);
    assert_eq!(info["size"].as_u64().unwrap(), 14);

    // Contents survive the rewrite.
    let drain = cmd().args(["drain", ring]).output().expect("drain");
    assert_eq!(drain.stdout, b"a little data\n");
}

#[test]
fn completions_emit_a_script() {
    let out = cmd()
        .args(["completions", "bash"])
        .output()
        .expect("completions");
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("ringfile"), "{text}");
}

#[test]
fn info_human_output_lists_fields() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ring = temp.path().join("plain.ring");
    let ring = ring.to_str().unwrap();

    assert!(cmd().args(["create", ring]).output().expect("create").status.success());

    let info = cmd().args(["info", ring]).output().expect("info");
    assert!(info.status.success());
    let text = String::from_utf8_lossy(&info.stdout);
    assert!(text.contains("capacity:"), "{text}");
    assert!(text.contains("wrapped:"), "{text}");
}

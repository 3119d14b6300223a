//! Purpose: Hold top-level CLI command execution for `ringfile`.
//! Exports: `dispatch`.
//! Role: Keep `main.rs` focused on parse/bootstrap and run commands here.
//! Invariants: Command stdout formats and exit code semantics stay stable.
//! Invariants: Rings opened for an existing file keep the stored capacity.
//! Invariants: Follow loops hold the file lock only while copying, never
//! across poll ticks, so feeders and followers interleave.

use super::*;

use std::thread;

use signal_hook::consts::SIGINT;

/// Poll cadence of the follow loops; also how promptly SIGINT is noticed.
const FOLLOW_TICK: Duration = Duration::from_millis(200);

/// Smallest capacity `shrink` keeps when no --capacity floor is given.
const SHRINK_FLOOR: usize = 4096;

/// How many times `feed` retries an open that lost the lock race.
const BUSY_RETRIES: u32 = 10;

pub(super) fn dispatch(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "ringfile", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Create {
            path,
            capacity,
            limit,
            sync,
        } => create(&path, &capacity, &limit, sync.into()),
        Command::Info { path, json } => info(&path, json),
        Command::Feed {
            path,
            data,
            limit,
            sync,
        } => feed(&path, data, limit.as_deref(), sync.into()),
        Command::Drain { path, follow } => drain(&path, follow),
        Command::Watch { path } => watch(&path),
        Command::Shrink { path, capacity } => shrink(&path, capacity.as_deref()),
    }
}

fn create(path: &Path, capacity: &str, limit: &str, sync: SyncMode) -> Result<RunOutcome, Error> {
    if path.exists() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("file already exists; feed appends to existing rings")
            .with_path(path));
    }
    let options = FileRingOptions {
        capacity: parse_size(capacity)?,
        limit: parse_size(limit)?,
        sync,
        ..FileRingOptions::default()
    };
    let ring = FileRing::open(path, options)?;
    let info = ring.info();
    ring.close();
    println!(
        "created {} capacity {} limit {}",
        path.display(),
        format_bytes(info.capacity as u64),
        format_bytes(info.limit as u64)
    );
    Ok(RunOutcome::ok())
}

fn info(path: &Path, json: bool) -> Result<RunOutcome, Error> {
    let header = FileRing::inspect(path)?;
    let metadata = fs::metadata(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("cannot stat ring file")
            .with_path(path)
            .with_source(err)
    })?;
    let modified = metadata.modified().ok().and_then(format_system_time);

    if json {
        let value = header_json(path, &header, modified.as_deref());
        let encoded = serde_json::to_string(&value).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("cannot encode info as JSON")
                .with_source(err)
        })?;
        println!("{encoded}");
        return Ok(RunOutcome::ok());
    }

    println!("path:      {}", path.display());
    println!("capacity:  {}", format_bytes(header.capacity as u64));
    println!("size:      {}", format_bytes(header.size as u64));
    println!("head:      {}", header.head_offset);
    println!("wrapped:   {}", header.wrapped);
    println!("file:      {}", format_bytes(header.file_len));
    if let Some(modified) = modified {
        println!("modified:  {modified}");
    }
    Ok(RunOutcome::ok())
}

fn header_json(path: &Path, header: &FileHeader, modified: Option<&str>) -> Value {
    let mut map = Map::new();
    map.insert("path".to_string(), json!(path.display().to_string()));
    map.insert("capacity".to_string(), json!(header.capacity));
    map.insert("size".to_string(), json!(header.size));
    map.insert("head_offset".to_string(), json!(header.head_offset));
    map.insert("wrapped".to_string(), json!(header.wrapped));
    map.insert("file_len".to_string(), json!(header.file_len));
    if let Some(modified) = modified {
        map.insert("modified".to_string(), json!(modified));
    }
    Value::Object(map)
}

/// Opens an existing ring at its stored capacity so the open never
/// migrates the file to a bigger layout behind the user's back.
fn open_existing(
    path: &Path,
    sync: SyncMode,
    limit: Option<usize>,
    write_wait: Wait,
) -> Result<FileRing, Error> {
    let header = FileRing::inspect(path)?;
    let defaults = FileRingOptions::default();
    let limit = limit.unwrap_or(defaults.limit).max(header.capacity);
    FileRing::open(
        path,
        FileRingOptions {
            capacity: header.capacity,
            limit,
            sync,
            write_wait,
            read_wait: Wait::Never,
            ..defaults
        },
    )
}

/// Like `open_existing`, with a bounded retry while another process holds
/// the ring. Follow loops release the lock between ticks, so a short wait
/// usually wins it.
fn open_with_retry(
    path: &Path,
    sync: SyncMode,
    limit: Option<usize>,
    write_wait: Wait,
) -> Result<FileRing, Error> {
    let mut attempt = 0;
    loop {
        match open_existing(path, sync, limit, write_wait) {
            Err(err) if err.kind() == ErrorKind::Busy && attempt < BUSY_RETRIES => {
                attempt += 1;
                thread::sleep(FOLLOW_TICK);
            }
            other => return other,
        }
    }
}

fn feed(
    path: &Path,
    data: Option<String>,
    limit: Option<&str>,
    sync: SyncMode,
) -> Result<RunOutcome, Error> {
    let limit = limit.map(parse_size).transpose()?;
    // Writes block for space so a feed bigger than the ring backpressures
    // instead of overflowing while a follower drains the other side.
    let ring = open_with_retry(path, sync, limit, Wait::Forever)?;
    let mut writer = ring.writer()?;
    let mut appended: u64 = 0;

    if let Some(data) = data {
        let mut bytes = data.into_bytes();
        bytes.push(b'\n');
        writer.write(&bytes)?;
        writer.flush()?;
        appended = bytes.len() as u64;
    } else {
        let mut stdin = io::stdin().lock();
        let mut buf = vec![0u8; ring.options().writer_buffer];
        loop {
            let n = stdin.read(&mut buf).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("cannot read stdin")
                    .with_source(err)
            })?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n])?;
            writer.flush()?;
            appended += n as u64;
        }
    }

    drop(writer);
    ring.close();
    println!("appended {} to {}", format_bytes(appended), path.display());
    Ok(RunOutcome::ok())
}

fn drain(path: &Path, follow: bool) -> Result<RunOutcome, Error> {
    let mut stdout = io::stdout().lock();

    if !follow {
        let ring = open_existing(path, SyncMode::None, None, Wait::Never)?;
        drain_available(&ring, &mut stdout)?;
        ring.close();
        return Ok(RunOutcome::ok());
    }

    let stop = install_stop_flag()?;
    while !stop.load(Ordering::Acquire) {
        match open_existing(path, SyncMode::None, None, Wait::Never) {
            Ok(ring) => {
                let outcome = drain_available(&ring, &mut stdout)?;
                ring.close();
                if outcome.is_none() {
                    // stdout's pipe closed; nothing left to deliver to.
                    return Ok(RunOutcome::ok());
                }
            }
            // Another process holds the ring right now; poll again.
            Err(err) if err.kind() == ErrorKind::Busy => {}
            Err(err) => return Err(err),
        }
        thread::sleep(FOLLOW_TICK);
    }
    Ok(RunOutcome::ok())
}

/// Copies everything currently buffered to stdout, evicting as it goes.
/// `Ok(None)` means stdout's pipe closed and the caller should exit.
fn drain_available(ring: &FileRing, stdout: &mut impl Write) -> Result<Option<u64>, Error> {
    let mut reader = ring.reader()?;
    let mut buf = vec![0u8; ring.options().reader_buffer];
    let mut total: u64 = 0;
    loop {
        let n = reader.try_read(&mut buf)?;
        if n == 0 {
            break;
        }
        match forward(stdout, &buf[..n])? {
            Some(()) => {}
            None => return Ok(None),
        }
        // Evict only what reached stdout; an interrupted drain loses nothing.
        ring.remove(n)?;
        total += n as u64;
    }
    if total > 0 && flush_stdout(stdout)?.is_none() {
        return Ok(None);
    }
    Ok(Some(total))
}

fn watch(path: &Path) -> Result<RunOutcome, Error> {
    let stop = install_stop_flag()?;
    let mut stdout = io::stdout().lock();
    // Bytes already printed, counted from the ring's current head.
    let mut seen: usize = 0;

    while !stop.load(Ordering::Acquire) {
        match open_existing(path, SyncMode::None, None, Wait::Never) {
            Ok(ring) => {
                let tick = watch_tick(&ring, &mut stdout, &mut seen, path)?;
                ring.close();
                if tick.is_none() {
                    return Ok(RunOutcome::ok());
                }
            }
            Err(err) if err.kind() == ErrorKind::Busy => {}
            Err(err) => return Err(err),
        }
        thread::sleep(FOLLOW_TICK);
    }
    Ok(RunOutcome::ok())
}

/// Prints the bytes that arrived since the last tick, timestamp-prefixed
/// and without evicting anything. `Ok(None)` means stdout's pipe closed.
fn watch_tick(
    ring: &FileRing,
    stdout: &mut impl Write,
    seen: &mut usize,
    path: &Path,
) -> Result<Option<()>, Error> {
    let mut reader = ring.reader()?;
    let skipped = reader.skip(*seen)?;
    if skipped < *seen {
        tracing::warn!(
            path = %path.display(),
            "eviction overtook the watch cursor; resuming from the current head"
        );
        *seen = skipped;
    }

    let mut buf = vec![0u8; ring.options().reader_buffer];
    let mut printed = false;
    loop {
        let n = reader.try_read(&mut buf)?;
        if n == 0 {
            break;
        }
        let ts = format_system_time(SystemTime::now()).unwrap_or_else(|| "-".to_string());
        let line = format!("{ts}  {}\n", buf[..n].as_bstr());
        if forward(stdout, line.as_bytes())?.is_none() {
            return Ok(None);
        }
        *seen += n;
        printed = true;
    }
    if printed && flush_stdout(stdout)?.is_none() {
        return Ok(None);
    }
    Ok(Some(()))
}

fn shrink(path: &Path, capacity: Option<&str>) -> Result<RunOutcome, Error> {
    let floor = capacity.map(parse_size).transpose()?;
    let header = FileRing::inspect(path)?;
    let defaults = FileRingOptions::default();
    let options = FileRingOptions {
        capacity: floor.unwrap_or(SHRINK_FLOOR),
        limit: defaults.limit.max(header.capacity),
        ..defaults
    };
    let ring = FileRing::open(path, options)?;
    let before = ring.capacity();
    let after = ring.shrink()?;
    ring.close();
    if after == before {
        println!(
            "{} already compact at {}",
            path.display(),
            format_bytes(before as u64)
        );
    } else {
        println!(
            "shrank {} from {} to {}",
            path.display(),
            format_bytes(before as u64),
            format_bytes(after as u64)
        );
    }
    Ok(RunOutcome::ok())
}

/// Writes to stdout, folding a closed pipe into `Ok(None)`.
fn forward(stdout: &mut impl Write, bytes: &[u8]) -> Result<Option<()>, Error> {
    match stdout.write_all(bytes) {
        Ok(()) => Ok(Some(())),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(None),
        Err(err) => Err(Error::new(ErrorKind::Io)
            .with_message("cannot write to stdout")
            .with_source(err)),
    }
}

fn flush_stdout(stdout: &mut impl Write) -> Result<Option<()>, Error> {
    match stdout.flush() {
        Ok(()) => Ok(Some(())),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(None),
        Err(err) => Err(Error::new(ErrorKind::Io)
            .with_message("cannot flush stdout")
            .with_source(err)),
    }
}

fn install_stop_flag() -> Result<Arc<AtomicBool>, Error> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop)).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("cannot install SIGINT handler")
            .with_source(err)
    })?;
    Ok(stop)
}

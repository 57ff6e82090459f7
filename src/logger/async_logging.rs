//! Dual-buffer asynchronous log back end.
//!
//! Producers append formatted lines into the *current* slab under a short
//! lock; a dedicated writer thread swaps the filled slabs out and does all
//! disk I/O, so no producer ever blocks on the file system. When producers
//! outrun the writer by more than 25 pending slabs, the tail is dropped and a
//! single notice line records how many.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;

use crate::logger::fixed::{FixedBuffer, LARGE_BUFFER};
use crate::logger::log_file::LogFile;

type Slab = FixedBuffer<LARGE_BUFFER>;

/// Pending slabs above which the writer starts discarding.
const DROP_THRESHOLD: usize = 25;

/// Slabs kept (written) when the drop policy kicks in.
const KEEP_ON_OVERFLOW: usize = 2;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

struct State {
    current: Box<Slab>,
    next: Option<Box<Slab>>,
    full: Vec<Box<Slab>>,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
    flush_interval: Duration,
}

pub struct AsyncLogging {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLogging {
    /// Spawns the writer thread. Fails only when the first log file cannot be
    /// created.
    pub fn start(
        dir: std::path::PathBuf,
        basename: &str,
        roll_size: u64,
    ) -> std::io::Result<Self> {
        Self::with_flush_interval(dir, basename, roll_size, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn with_flush_interval(
        dir: std::path::PathBuf,
        basename: &str,
        roll_size: u64,
        flush_interval: Duration,
    ) -> std::io::Result<Self> {
        let log_file = LogFile::create(dir, basename, roll_size)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                current: Box::new(Slab::new()),
                next: Some(Box::new(Slab::new())),
                full: Vec::with_capacity(16),
                running: true,
            }),
            ready: Condvar::new(),
            flush_interval,
        });
        let writer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("log-writer".into())
                .spawn(move || writer_loop(&shared, log_file))?
        };
        Ok(Self {
            shared,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Appends one formatted line. Only takes the state mutex; disk I/O
    /// happens on the writer thread.
    pub fn append(&self, line: &[u8]) {
        let mut state = self.shared.state.lock().unwrap();
        if state.current.writable_len() > line.len() {
            state.current.append(line);
            return;
        }
        // Current is full: hand it to the writer and continue on the spare.
        let next = state
            .next
            .take()
            .unwrap_or_else(|| Box::new(Slab::new()));
        let full = std::mem::replace(&mut state.current, next);
        state.full.push(full);
        state.current.append(line);
        drop(state);
        self.shared.ready.notify_one();
    }

    /// Nudges the writer to drain ahead of its flush interval.
    pub fn flush(&self) {
        self.shared.ready.notify_one();
    }

    /// Stops the writer after a final drain and joins it. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = false;
        }
        self.shared.ready.notify_all();
        if let Some(writer) = self.writer.lock().unwrap().take() {
            let _ = writer.join();
        }
    }
}

impl Drop for AsyncLogging {
    fn drop(&mut self) {
        self.stop();
    }
}

fn writer_loop(shared: &Shared, mut log_file: LogFile) {
    // Two pre-allocated spares swapped in under the lock, reclaimed from the
    // written-out slabs afterwards.
    let mut spare1 = Some(Box::new(Slab::new()));
    let mut spare2 = Some(Box::new(Slab::new()));
    let mut to_write: Vec<Box<Slab>> = Vec::with_capacity(16);

    loop {
        let running = collect(shared, &mut spare1, &mut spare2, &mut to_write);
        write_out(&mut to_write, &mut log_file, &mut spare1, &mut spare2);
        log_file.flush();
        if !running {
            break;
        }
    }
}

/// Critical section of one writer cycle: wait for work (or the flush
/// interval), then take everything pending, including the partially filled
/// current slab.
fn collect(
    shared: &Shared,
    spare1: &mut Option<Box<Slab>>,
    spare2: &mut Option<Box<Slab>>,
    to_write: &mut Vec<Box<Slab>>,
) -> bool {
    let mut state = shared.state.lock().unwrap();
    if state.full.is_empty() && state.running {
        let (guard, _) = shared
            .ready
            .wait_timeout_while(state, shared.flush_interval, |s| {
                s.full.is_empty() && s.running
            })
            .unwrap();
        state = guard;
    }
    // Push current unconditionally so a slow trickle still reaches disk at
    // least every flush interval.
    let current = std::mem::replace(
        &mut state.current,
        spare1.take().unwrap_or_else(|| Box::new(Slab::new())),
    );
    state.full.push(current);
    std::mem::swap(&mut state.full, to_write);
    if state.next.is_none() {
        state.next = spare2.take();
    }
    state.running
}

/// Writes the drained slabs, applying the drop-on-overflow policy, then
/// reclaims up to two of them as the next cycle's spares.
fn write_out(
    to_write: &mut Vec<Box<Slab>>,
    log_file: &mut LogFile,
    spare1: &mut Option<Box<Slab>>,
    spare2: &mut Option<Box<Slab>>,
) {
    if to_write.len() > DROP_THRESHOLD {
        let notice = format!(
            "Dropped log messages at {}, {} larger buffers\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            to_write.len() - KEEP_ON_OVERFLOW
        );
        eprint!("{notice}");
        log_file.append(notice.as_bytes());
        to_write.truncate(KEEP_ON_OVERFLOW);
    }

    for slab in to_write.iter() {
        if !slab.is_empty() {
            log_file.append(slab.as_bytes());
        }
    }

    for spare in [spare1, spare2] {
        if spare.is_none() {
            if let Some(mut slab) = to_write.pop() {
                slab.clear();
                *spare = Some(slab);
            } else {
                *spare = Some(Box::new(Slab::new()));
            }
        }
    }
    to_write.clear();
}

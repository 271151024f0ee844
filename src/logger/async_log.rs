use std::io::Write;
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::log_file::LogFile;

pub const DEFAULT_ROLL_SIZE: u64 = 500 * 1024 * 1024;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

const BUFFER_SIZE: usize = 64 * 1024;
// Past this many queued buffers the writer sheds load instead of letting
// a stalled disk pile memory up.
const MAX_BACKLOG: usize = 25;

struct LogBuffer {
    data: Vec<u8>,
}

impl LogBuffer {
    fn new() -> LogBuffer {
        LogBuffer {
            data: Vec::with_capacity(BUFFER_SIZE),
        }
    }

    fn avail(&self) -> usize {
        BUFFER_SIZE.saturating_sub(self.data.len())
    }

    fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

struct Front {
    current: LogBuffer,
    spare: Option<LogBuffer>,
    pending: Vec<LogBuffer>,
    running: bool,
}

struct Inner {
    front: Mutex<Front>,
    cond: Condvar,
    basename: PathBuf,
    roll_size: u64,
    flush_interval: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Double-buffered asynchronous log sink.
///
/// The hot path appends into one of two front buffers under a short
/// mutex hold (a memcpy of at most one record); full buffers move to a
/// pending list that a background thread writes to a rolling
/// [`LogFile`]. [`stop`] drains what is queued and joins the thread.
///
/// [`stop`]: AsyncLogging::stop
#[derive(Clone)]
pub struct AsyncLogging {
    inner: Arc<Inner>,
}

impl AsyncLogging {
    pub fn new<P: Into<PathBuf>>(
        basename: P,
        roll_size: u64,
        flush_interval: Duration,
    ) -> AsyncLogging {
        AsyncLogging {
            inner: Arc::new(Inner {
                front: Mutex::new(Front {
                    current: LogBuffer::new(),
                    spare: Some(LogBuffer::new()),
                    pending: Vec::new(),
                    running: false,
                }),
                cond: Condvar::new(),
                basename: basename.into(),
                roll_size,
                flush_interval,
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self) {
        {
            let mut front = self.inner.front.lock().unwrap();
            if front.running {
                return;
            }
            front.running = true;
        }

        let inner = self.inner.clone();
        let thread = thread::Builder::new()
            .name("async-log".into())
            .spawn(move || backend(&inner))
            .expect("AsyncLogging: spawn");
        *self.inner.thread.lock().unwrap() = Some(thread);
    }

    /// Copy one record into the front buffer.
    pub fn append(&self, bytes: &[u8]) {
        let mut front = self.inner.front.lock().unwrap();

        if front.current.avail() >= bytes.len() {
            front.current.append(bytes);
            return;
        }

        let fresh = front.spare.take().unwrap_or_else(LogBuffer::new);
        let full = mem::replace(&mut front.current, fresh);
        front.pending.push(full);

        front.current.append(bytes);
        self.inner.cond.notify_one();
    }

    /// Drain queued buffers and join the writer thread.
    pub fn stop(&self) {
        {
            let mut front = self.inner.front.lock().unwrap();
            if !front.running {
                return;
            }
            front.running = false;
        }
        self.inner.cond.notify_one();

        if let Some(thread) = self.inner.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn backend(inner: &Inner) {
    let mut output = match LogFile::open(&inner.basename, inner.roll_size) {
        Ok(output) => output,
        Err(e) => {
            let _ = writeln!(
                std::io::stderr(),
                "AsyncLogging: cannot open {}: {}",
                inner.basename.display(),
                e
            );
            return;
        }
    };

    let mut spare1 = Some(LogBuffer::new());
    let mut spare2 = Some(LogBuffer::new());
    let mut to_write: Vec<LogBuffer> = Vec::with_capacity(16);

    loop {
        let running;
        {
            let mut front = inner.front.lock().unwrap();

            if front.running && front.pending.is_empty() && front.current.is_empty() {
                let (guard, _) = inner
                    .cond
                    .wait_timeout(front, inner.flush_interval)
                    .unwrap();
                front = guard;
            }

            if !front.current.is_empty() {
                let replacement = spare1.take().unwrap_or_else(LogBuffer::new);
                let full = mem::replace(&mut front.current, replacement);
                front.pending.push(full);
            }
            if front.spare.is_none() {
                front.spare = spare2.take();
            }

            mem::swap(&mut to_write, &mut front.pending);
            running = front.running;
        }

        if to_write.len() > MAX_BACKLOG {
            let notice = format!(
                "AsyncLogging: dropped {} log buffers at {}\n",
                to_write.len() - 2,
                inner.basename.display()
            );
            let _ = std::io::stderr().write_all(notice.as_bytes());
            to_write.truncate(2);
        }

        for buffer in &to_write {
            if let Err(e) = output.append(&buffer.data) {
                let _ = writeln!(std::io::stderr(), "AsyncLogging: write: {}", e);
                break;
            }
        }
        let _ = output.flush();

        // Recycle up to two emptied buffers as the next replacements.
        to_write.truncate(2);
        if spare1.is_none() {
            let mut buffer = to_write.pop().unwrap_or_else(LogBuffer::new);
            buffer.clear();
            spare1 = Some(buffer);
        }
        if spare2.is_none() {
            let mut buffer = to_write.pop().unwrap_or_else(LogBuffer::new);
            buffer.clear();
            spare2 = Some(buffer);
        }
        to_write.clear();

        if !running {
            let front = inner.front.lock().unwrap();
            if front.pending.is_empty() && front.current.is_empty() {
                break;
            }
        }
    }

    let _ = output.flush();
}

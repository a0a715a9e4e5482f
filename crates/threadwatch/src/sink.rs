//! Destinations for rendered events.
//!
//! Every sink owns a write region: a `parking_lot::Mutex` entered with a
//! timeout. A rendered event is written in full while the region is held, so
//! blocks from different threads never interleave inside one another. When
//! the region cannot be entered in time the block is refused with
//! [`SinkWriteError::Busy`] and the caller drops it instead of waiting.
//!
//! The timeout covers the write region only. [`StdoutSink`] and
//! [`StderrSink`] then go through the standard library's stream locks and a
//! blocking `write`, neither of which can be timed: an application thread
//! holding `io::stdout().lock()`, or a pipe nobody drains, stalls the firing
//! thread until the stream moves again. Use [`RingBufferSink`],
//! [`TracingSink`] or [`FileSink`] where a stalled reader is possible.

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum SinkWriteError {
    Io(io::Error),
    Busy { timeout: Duration },
    Closed,
}

impl fmt::Display for SinkWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "sink write failed: {err}"),
            Self::Busy { timeout } => {
                write!(f, "sink busy: write region not available within {timeout:?}")
            }
            Self::Closed => write!(f, "sink is closed"),
        }
    }
}

impl std::error::Error for SinkWriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SinkWriteError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

pub trait Sink: Send + Sync {
    /// Writes one rendered block. Must either write all of it or fail.
    fn write_block(&self, block: &str) -> Result<(), SinkWriteError>;
}

struct WriteRegion<T> {
    state: Mutex<T>,
    timeout: Duration,
}

impl<T> WriteRegion<T> {
    fn new(state: T, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(state),
            timeout,
        }
    }

    fn enter(&self) -> Result<MutexGuard<'_, T>, SinkWriteError> {
        self.state
            .try_lock_for(self.timeout)
            .ok_or(SinkWriteError::Busy {
                timeout: self.timeout,
            })
    }
}

/// Writes blocks to the process's standard output.
///
/// Bounded only up to the write region; see the module docs.
pub struct StdoutSink {
    region: WriteRegion<()>,
}

impl StdoutSink {
    pub fn new(timeout: Duration) -> Self {
        Self {
            region: WriteRegion::new((), timeout),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_TIMEOUT)
    }
}

impl Sink for StdoutSink {
    fn write_block(&self, block: &str) -> Result<(), SinkWriteError> {
        let _region = self.region.enter()?;
        let mut out = io::stdout().lock();
        out.write_all(block.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

/// Same as [`StdoutSink`], on standard error.
pub struct StderrSink {
    region: WriteRegion<()>,
}

impl StderrSink {
    pub fn new(timeout: Duration) -> Self {
        Self {
            region: WriteRegion::new((), timeout),
        }
    }
}

impl Sink for StderrSink {
    fn write_block(&self, block: &str) -> Result<(), SinkWriteError> {
        let _region = self.region.enter()?;
        let mut err = io::stderr().lock();
        err.write_all(block.as_bytes())?;
        Ok(())
    }
}

/// Appends blocks to a log file.
pub struct FileSink {
    path: PathBuf,
    region: WriteRegion<Option<File>>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            region: WriteRegion::new(Some(file), timeout),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the file; later writes fail with [`SinkWriteError::Closed`].
    pub fn close(&self) -> Result<(), SinkWriteError> {
        let mut file = self.region.enter()?;
        if let Some(mut file) = file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

impl Sink for FileSink {
    fn write_block(&self, block: &str) -> Result<(), SinkWriteError> {
        let mut file = self.region.enter()?;
        let Some(file) = file.as_mut() else {
            return Err(SinkWriteError::Closed);
        };
        file.write_all(block.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Keeps the most recent `capacity` blocks in memory.
pub struct RingBufferSink {
    capacity: usize,
    region: WriteRegion<VecDeque<String>>,
}

impl RingBufferSink {
    pub fn new(capacity: usize) -> Self {
        Self::with_timeout(capacity, DEFAULT_WRITE_TIMEOUT)
    }

    pub fn with_timeout(capacity: usize, timeout: Duration) -> Self {
        Self {
            capacity,
            region: WriteRegion::new(VecDeque::with_capacity(capacity.min(1024)), timeout),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn blocks(&self) -> Vec<String> {
        self.region.state.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.region.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for RingBufferSink {
    fn write_block(&self, block: &str) -> Result<(), SinkWriteError> {
        if self.capacity == 0 {
            return Err(SinkWriteError::Closed);
        }
        let mut blocks = self.region.enter()?;
        if blocks.len() == self.capacity {
            blocks.pop_front();
        }
        blocks.push_back(block.to_owned());
        Ok(())
    }
}

/// Forwards each block as one `tracing` record under `threadwatch::event`.
#[derive(Default)]
pub struct TracingSink;

impl Sink for TracingSink {
    fn write_block(&self, block: &str) -> Result<(), SinkWriteError> {
        tracing::info!(target: "threadwatch::event", "{}", block.trim_end());
        Ok(())
    }
}

/// Textual sink selector: `stdout`, `stderr`, `tracing`, `ring:<capacity>` or
/// `file:<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkSpec {
    Stdout,
    Stderr,
    Tracing,
    Ring(usize),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSpecError(String);

impl fmt::Display for SinkSpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid sink {:?}: expected stdout, stderr, tracing, ring:<capacity> or file:<path>",
            self.0
        )
    }
}

impl std::error::Error for SinkSpecError {}

impl FromStr for SinkSpec {
    type Err = SinkSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => return Ok(Self::Stdout),
            "stderr" => return Ok(Self::Stderr),
            "tracing" => return Ok(Self::Tracing),
            _ => {}
        }
        if let Some(capacity) = s.strip_prefix("ring:") {
            return capacity
                .parse::<usize>()
                .map(Self::Ring)
                .map_err(|_| SinkSpecError(s.to_owned()));
        }
        if let Some(path) = s.strip_prefix("file:")
            && !path.is_empty()
        {
            return Ok(Self::File(PathBuf::from(path)));
        }
        Err(SinkSpecError(s.to_owned()))
    }
}

impl SinkSpec {
    pub fn open(&self, timeout: Duration) -> io::Result<Arc<dyn Sink>> {
        Ok(match self {
            Self::Stdout => Arc::new(StdoutSink::new(timeout)),
            Self::Stderr => Arc::new(StderrSink::new(timeout)),
            Self::Tracing => Arc::new(TracingSink),
            Self::Ring(capacity) => Arc::new(RingBufferSink::with_timeout(*capacity, timeout)),
            Self::File(path) => Arc::new(FileSink::open(path, timeout)?),
        })
    }
}

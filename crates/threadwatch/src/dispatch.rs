use crate::registry::{ProbeRegistry, RegisteredProbe};
use crate::report::{ReportError, Reporter};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use threadwatch_capture::{BacktraceCapturer, StackCapturer, prepare_symbolizer};
use threadwatch_types::{Event, InvariantError};
use tracing::debug;

/// Leading frames that belong to dispatch rather than to the code that
/// reached the trigger point. Only the fire path itself is listed: code in a
/// binary that happens to be named `threadwatch` must still be reported.
pub const DISPATCH_INTERNAL_PREFIXES: &[&str] = &[
    "threadwatch::dispatch::Dispatcher::",
    "threadwatch::fire",
    "std::panicking",
    "std::panic::",
    "core::panic::",
    "core::ops::function::",
    "__rust_try",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// No enabled probe is bound to the trigger location.
    Skipped,
    Reported,
    /// The event was built but could not be delivered.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub fired: u64,
    pub reported: u64,
    pub dropped: u64,
}

#[derive(Debug)]
enum DispatchError {
    Invariant(InvariantError),
    Report(ReportError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invariant(err) => write!(f, "malformed event: {err}"),
            Self::Report(err) => write!(f, "{err}"),
        }
    }
}

impl From<InvariantError> for DispatchError {
    fn from(value: InvariantError) -> Self {
        Self::Invariant(value)
    }
}

impl From<ReportError> for DispatchError {
    fn from(value: ReportError) -> Self {
        Self::Report(value)
    }
}

/// Entry point called from instrumented code.
///
/// `fire` runs on the calling thread and never reports failure to it: a
/// sink error, a malformed event or a panic anywhere on the enabled path
/// counts as a dropped event and the call returns normally. Nothing is
/// retried.
pub struct Dispatcher {
    registry: Arc<ProbeRegistry>,
    capturer: Box<dyn StackCapturer>,
    reporter: Reporter,
    fired: AtomicU64,
    reported: AtomicU64,
    dropped: AtomicU64,
}

impl Dispatcher {
    /// Uses [`BacktraceCapturer`] and loads debug info up front, so the
    /// first firing does not read it from disk.
    pub fn new(registry: Arc<ProbeRegistry>, reporter: Reporter) -> Self {
        prepare_symbolizer();
        Self {
            registry,
            capturer: Box::new(BacktraceCapturer::with_internal_prefixes(
                DISPATCH_INTERNAL_PREFIXES,
            )),
            reporter,
            fired: AtomicU64::new(0),
            reported: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_capturer(mut self, capturer: impl StackCapturer + 'static) -> Self {
        self.capturer = Box::new(capturer);
        self
    }

    pub fn registry(&self) -> &Arc<ProbeRegistry> {
        &self.registry
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn fire(&self, trigger_location: &str, message: &str) -> FireOutcome {
        self.fire_with(trigger_location, || message.to_owned())
    }

    /// Like [`Dispatcher::fire`], but only builds the message once an enabled
    /// probe matched. Nothing is allocated when the trigger is not live.
    pub fn fire_with(
        &self,
        trigger_location: &str,
        message: impl FnOnce() -> String,
    ) -> FireOutcome {
        let Some(probe) = self.registry.lookup(trigger_location) else {
            return FireOutcome::Skipped;
        };
        self.fired.fetch_add(1, Ordering::Relaxed);

        match panic::catch_unwind(AssertUnwindSafe(|| self.emit(&probe, message()))) {
            Ok(Ok(())) => {
                self.reported.fetch_add(1, Ordering::Relaxed);
                FireOutcome::Reported
            }
            Ok(Err(err)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(probe = %probe.id(), error = %err, "dropped event");
                FireOutcome::Dropped
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(probe = %probe.id(), "dropped event: panic while reporting");
                FireOutcome::Dropped
            }
        }
    }

    fn emit(&self, probe: &RegisteredProbe, message: String) -> Result<(), DispatchError> {
        let depth = probe.max_stack_depth();
        let limit = depth.frame_limit();

        // One frame past the limit tells us whether the chain was cut.
        let mut frames = self.capturer.capture(limit.saturating_add(1));
        let truncated = frames.len() > limit;
        frames.truncate(limit);

        let event = Event::new(
            probe.id().clone(),
            now_nanos(),
            message,
            frames,
            truncated,
            depth,
        )?
        .with_thread_name(std::thread::current().name().map(str::to_owned));

        self.reporter.report(&event)?;
        Ok(())
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            fired: self.fired.load(Ordering::Relaxed),
            reported: self.reported.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Events built but not delivered since startup.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

//! Thread lifecycle observer.
//!
//! A probe binds a symbolic trigger location (`ThreadPoolExecutor.addWorker`,
//! `Thread.start`, ...) to a fixed action: capture the caller's stack up to
//! the probe's depth and write one report block to a sink. Instrumented code
//! calls [`fire`] (or [`Dispatcher::fire`]) at the point of interest; when no
//! enabled probe is bound there the call returns immediately without
//! allocating.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use threadwatch::{ObserverConfig, preset::POOL_ADD_WORKER};
//!
//! let dispatcher = ObserverConfig::preset().build_dispatcher().unwrap();
//! threadwatch::install(Arc::new(dispatcher)).unwrap();
//!
//! // at the instrumented site:
//! threadwatch::fire(POOL_ADD_WORKER, "called");
//! ```
//!
//! # Ordering
//!
//! Each event is rendered and written as one block while the sink's write
//! region is held, so a block is never split by another thread's output.
//! Events fired by one thread appear in firing order. Blocks from different
//! threads interleave in whatever order they enter the write region; there is
//! no global ordering.
//!
//! # Failure
//!
//! Nothing on the fire path propagates to the caller. Sink errors, a sink
//! that stays busy past its write timeout, and panics while capturing or
//! rendering all drop the event and bump [`DispatchStats::dropped`].

pub mod config;
pub mod dispatch;
pub mod preset;
pub mod registry;
pub mod report;
pub mod sink;
pub mod thread;

pub use config::{ConfigError, ObserverConfig, ProbeConfig};
pub use dispatch::{DispatchStats, Dispatcher, FireOutcome};
pub use registry::{ProbeRegistry, RegisteredProbe, RegistryError};
pub use report::{ReportError, ReportFormat, Reporter};
pub use sink::{Sink, SinkSpec, SinkWriteError};
pub use threadwatch_capture::{BacktraceCapturer, FixedDepthCapturer, StackCapturer};
pub use threadwatch_types::{
    Event, MaxStackDepth, ProbeDescriptor, ProbeId, StackFrame, TriggerLocation,
};

use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::info;

static DISPATCHER: OnceLock<Arc<Dispatcher>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallError {
    AlreadyInstalled,
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInstalled => write!(f, "a dispatcher is already installed"),
        }
    }
}

impl std::error::Error for InstallError {}

/// Makes `dispatcher` the process-wide target of [`fire`]. Can happen once.
pub fn install(dispatcher: Arc<Dispatcher>) -> Result<(), InstallError> {
    let probes = dispatcher.registry().len();
    DISPATCHER
        .set(dispatcher)
        .map_err(|_| InstallError::AlreadyInstalled)?;
    info!(probes, "installed process-wide dispatcher");
    Ok(())
}

pub fn installed() -> Option<&'static Arc<Dispatcher>> {
    DISPATCHER.get()
}

/// Fires through the installed dispatcher; a no-op before [`install`].
#[inline]
pub fn fire(trigger_location: &str, message: &str) -> FireOutcome {
    match DISPATCHER.get() {
        Some(dispatcher) => dispatcher.fire(trigger_location, message),
        None => FireOutcome::Skipped,
    }
}

#[inline]
pub fn fire_with(trigger_location: &str, message: impl FnOnce() -> String) -> FireOutcome {
    match DISPATCHER.get() {
        Some(dispatcher) => dispatcher.fire_with(trigger_location, message),
        None => FireOutcome::Skipped,
    }
}

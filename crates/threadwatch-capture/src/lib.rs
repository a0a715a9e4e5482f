//! Call-stack capture for probe firings.
//!
//! Capture happens in two steps. [`capture_raw`] walks the current thread's
//! stack and records instruction pointers only: it resolves nothing, reads
//! nothing from disk and stops as soon as it has the requested number of
//! frames, so its cost grows with the limit and not with the depth of the
//! call chain. [`symbolize`] then turns those addresses into names and
//! `file:line` locations, dropping frames that belong to the unwinder and to
//! the capture itself, then any leading frames matching the internal
//! prefixes (ours plus the caller's).
//!
//! Symbolization reads debug info the first time it sees a module. Call
//! [`prepare_symbolizer`] at startup so that cost is paid before the first
//! probe fires; later lookups are served from the symbolizer's cache.

use std::ffi::c_void;
use threadwatch_types::StackFrame;

/// Symbol prefixes that are always treated as capture machinery.
pub const BUILTIN_INTERNAL_PREFIXES: &[&str] = &[
    "backtrace::",
    "threadwatch_capture::capture_current",
    "threadwatch_capture::BacktraceCapturer",
];

pub const UNKNOWN_FRAME_NAME: &str = "<unknown>";

const BOUNDARY_SYMBOL: &str = "threadwatch_capture::capture_raw";

// Frames examined while looking for `capture_raw` before giving up and
// reporting everything (stripped binaries never resolve the boundary).
const MAX_UNWINDER_FRAMES: usize = 32;

/// Extra addresses recorded past the requested limit, covering the unwinder,
/// the capture path and the caller's internal frames that are dropped during
/// symbolization.
pub const INTERNAL_FRAME_SLACK: usize = 64;

/// Source of call-chain snapshots.
///
/// Implementations return at most `limit` frames, innermost first, and
/// exclude their own frames. The stack walk must not block: no I/O, no locks
/// that an instrumented thread may hold.
pub trait StackCapturer: Send + Sync {
    fn capture(&self, limit: usize) -> Vec<StackFrame>;
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub max_frames: usize,
    /// Extra leading-frame prefixes to skip, on top of
    /// [`BUILTIN_INTERNAL_PREFIXES`].
    pub internal_prefixes: &'static [&'static str],
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_frames: threadwatch_types::DEFAULT_MAX_STACK_DEPTH as usize,
            internal_prefixes: &[],
        }
    }
}

/// An unresolved return address, as recorded by [`capture_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub ip: usize,
}

/// Captures the calling thread's stack, innermost frame first.
#[inline(never)]
pub fn capture_current(options: CaptureOptions) -> Vec<StackFrame> {
    if options.max_frames == 0 {
        return Vec::new();
    }
    let raw = capture_raw(options.max_frames.saturating_add(INTERNAL_FRAME_SLACK));
    symbolize(&raw, options)
}

/// Records at most `max_frames` return addresses of the calling thread,
/// innermost first, starting with the unwinder's own frames.
#[inline(never)]
pub fn capture_raw(max_frames: usize) -> Vec<RawFrame> {
    let mut frames = Vec::with_capacity(max_frames.min(128));
    if max_frames == 0 {
        return frames;
    }
    let mut visit = |frame: &backtrace::Frame| {
        frames.push(RawFrame {
            ip: frame.ip() as usize,
        });
        frames.len() < max_frames
    };
    walk_stack(&mut visit);
    frames
}

// The system unwinder is thread-safe on unix, so the walk skips backtrace's
// global lock there.
#[cfg(unix)]
fn walk_stack(visit: &mut dyn FnMut(&backtrace::Frame) -> bool) {
    // SAFETY: `_Unwind_Backtrace` may be called concurrently from any thread.
    unsafe { backtrace::trace_unsynchronized(visit) }
}

#[cfg(not(unix))]
fn walk_stack(visit: &mut dyn FnMut(&backtrace::Frame) -> bool) {
    backtrace::trace(visit)
}

/// Resolves `raw` into at most `options.max_frames` frames.
///
/// Everything up to and including [`capture_raw`] is dropped, then leading
/// frames that match the internal prefixes. Addresses that resolve to no
/// symbol are reported as `module+0xoffset`.
pub fn symbolize(raw: &[RawFrame], options: CaptureOptions) -> Vec<StackFrame> {
    let mut walk = Walk {
        options,
        frames: Vec::with_capacity(options.max_frames.min(64)),
        unwinder: Vec::new(),
        past_boundary: false,
        skipping: true,
    };
    if options.max_frames == 0 {
        return walk.frames;
    }

    for frame in raw {
        let ip = frame.ip as *mut c_void;
        let mut symbols = Vec::new();
        backtrace::resolve(ip, |symbol| {
            symbols.push(ResolvedSymbol {
                name: symbol.name().map(|name| format!("{name:#}")),
                location: match (symbol.filename(), symbol.lineno()) {
                    (Some(file), Some(line)) => Some(format!("{}:{line}", file.display())),
                    (Some(file), None) => Some(file.display().to_string()),
                    _ => None,
                },
            });
        });
        if symbols.is_empty() {
            symbols.push(ResolvedSymbol {
                name: None,
                location: module_location_for_ip(ip),
            });
        }

        // One physical frame can carry several inlined symbols, innermost first.
        if !symbols.into_iter().all(|symbol| walk.visit(symbol)) {
            break;
        }
    }

    if !walk.past_boundary {
        let pending = std::mem::take(&mut walk.unwinder);
        for symbol in pending {
            if !walk.keep(symbol) {
                break;
            }
        }
    }
    walk.frames
}

/// Loads debug info for the calling module so the first probe firing does
/// not pay for it.
pub fn prepare_symbolizer() {
    let ip = prepare_symbolizer as fn() as usize as *mut c_void;
    backtrace::resolve(ip, |_| {});
}

struct Walk {
    options: CaptureOptions,
    frames: Vec<StackFrame>,
    unwinder: Vec<ResolvedSymbol>,
    past_boundary: bool,
    skipping: bool,
}

impl Walk {
    /// Returns false once the walk should stop.
    fn visit(&mut self, symbol: ResolvedSymbol) -> bool {
        if !self.past_boundary {
            if symbol.name.as_deref() == Some(BOUNDARY_SYMBOL) {
                self.past_boundary = true;
                self.unwinder.clear();
                return true;
            }
            self.unwinder.push(symbol);
            if self.unwinder.len() < MAX_UNWINDER_FRAMES {
                return true;
            }
            self.past_boundary = true;
            let pending = std::mem::take(&mut self.unwinder);
            return pending.into_iter().all(|symbol| self.keep(symbol));
        }
        if self.skipping && symbol.is_internal(self.options.internal_prefixes) {
            return true;
        }
        self.keep(symbol)
    }

    fn keep(&mut self, symbol: ResolvedSymbol) -> bool {
        self.skipping = false;
        if self.frames.len() >= self.options.max_frames {
            return false;
        }
        self.frames.push(symbol.into_stack_frame());
        self.frames.len() < self.options.max_frames
    }
}

struct ResolvedSymbol {
    name: Option<String>,
    location: Option<String>,
}

impl ResolvedSymbol {
    fn is_internal(&self, extra: &[&str]) -> bool {
        let Some(name) = self.name.as_deref() else {
            return false;
        };
        is_internal_name(name, extra)
    }

    fn into_stack_frame(self) -> StackFrame {
        StackFrame {
            qualified_name: self
                .name
                .unwrap_or_else(|| UNKNOWN_FRAME_NAME.to_string()),
            source_location: self.location,
        }
    }
}

/// Whether `name` belongs to capture machinery. Trait-impl symbols such as
/// `<threadwatch_capture::BacktraceCapturer as ...>::capture` are matched on
/// their self type.
pub fn is_internal_name(name: &str, extra: &[&str]) -> bool {
    let matches = |candidate: &str| {
        BUILTIN_INTERNAL_PREFIXES
            .iter()
            .chain(extra.iter())
            .any(|prefix| candidate.starts_with(prefix))
    };
    if matches(name) {
        return true;
    }
    if let Some(inner) = name.strip_prefix('<') {
        let self_type = if let Some(pos) = inner.find(" as ") {
            &inner[..pos]
        } else if let Some(pos) = inner.find('>') {
            &inner[..pos]
        } else {
            inner
        };
        return matches(self_type);
    }
    false
}

#[cfg(unix)]
fn module_location_for_ip(ip: *mut c_void) -> Option<String> {
    use std::ffi::CStr;

    let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();
    let ok = unsafe { libc::dladdr(ip as *const c_void, info.as_mut_ptr()) };
    if ok == 0 {
        return None;
    }

    let info = unsafe { info.assume_init() };
    if info.dli_fbase.is_null() || info.dli_fname.is_null() {
        return None;
    }

    let path = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy();
    let module = std::path::Path::new(path.as_ref())
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    let offset = (ip as usize).checked_sub(info.dli_fbase as usize)?;
    Some(format!("{module}+0x{offset:x}"))
}

#[cfg(not(unix))]
fn module_location_for_ip(_ip: *mut c_void) -> Option<String> {
    None
}

/// [`StackCapturer`] backed by [`capture_current`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceCapturer {
    internal_prefixes: &'static [&'static str],
}

impl BacktraceCapturer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_prefixes(internal_prefixes: &'static [&'static str]) -> Self {
        Self { internal_prefixes }
    }
}

impl StackCapturer for BacktraceCapturer {
    #[inline(never)]
    fn capture(&self, limit: usize) -> Vec<StackFrame> {
        capture_current(CaptureOptions {
            max_frames: limit,
            internal_prefixes: self.internal_prefixes,
        })
    }
}

/// Capturer that reports a synthetic call chain of exactly `depth` frames.
///
/// Useful for hosts without an unwinder and for exercising truncation.
#[derive(Debug, Clone, Copy)]
pub struct FixedDepthCapturer {
    depth: usize,
}

impl FixedDepthCapturer {
    pub fn new(depth: usize) -> Self {
        Self { depth }
    }
}

impl StackCapturer for FixedDepthCapturer {
    fn capture(&self, limit: usize) -> Vec<StackFrame> {
        (0..self.depth.min(limit))
            .map(|level| {
                StackFrame::new(format!("synthetic::level_{level}"))
                    .with_source_location(format!("synthetic.rs:{}", level + 1))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn nested_level(remaining: usize, limit: usize) -> Vec<StackFrame> {
        if remaining == 0 {
            return capture_current(CaptureOptions {
                max_frames: limit,
                internal_prefixes: &[],
            });
        }
        let frames = nested_level(remaining - 1, limit);
        std::hint::black_box(frames)
    }

    #[test]
    fn capture_stops_at_limit() {
        let frames = nested_level(10, 3);
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn capture_with_zero_limit_is_empty() {
        assert!(nested_level(2, 0).is_empty());
    }

    #[test]
    fn capture_below_limit_returns_whole_chain() {
        let frames = nested_level(4, threadwatch_types::HARD_FRAME_CEILING);
        assert!(!frames.is_empty());
        assert!(frames.len() < threadwatch_types::HARD_FRAME_CEILING);
    }

    #[test]
    fn capture_starts_at_the_caller() {
        let frames = nested_level(3, 8);
        let first = &frames[0].qualified_name;
        assert!(
            first.contains("nested_level"),
            "first frame should be the caller, got {first}"
        );
    }

    #[inline(never)]
    fn nested_raw(remaining: usize, max_frames: usize) -> Vec<RawFrame> {
        if remaining == 0 {
            return capture_raw(max_frames);
        }
        let frames = nested_raw(remaining - 1, max_frames);
        std::hint::black_box(frames)
    }

    #[test]
    fn raw_walk_is_bounded_by_its_limit() {
        let raw = nested_raw(200, 8);
        assert_eq!(raw.len(), 8);
        assert!(raw.iter().all(|frame| frame.ip != 0));
        assert!(nested_raw(3, 0).is_empty());
    }

    #[test]
    fn symbolize_after_the_walk_starts_at_the_caller() {
        prepare_symbolizer();
        let raw = nested_raw(3, 4 + INTERNAL_FRAME_SLACK);
        let frames = symbolize(
            &raw,
            CaptureOptions {
                max_frames: 4,
                internal_prefixes: &[],
            },
        );
        assert_eq!(frames.len(), 4);
        assert!(
            frames[0].qualified_name.contains("nested_raw"),
            "first frame should be the caller, got {}",
            frames[0].qualified_name
        );
        assert!(
            frames
                .iter()
                .all(|frame| !frame.qualified_name.starts_with("threadwatch_capture::capture_raw"))
        );
    }

    #[test]
    fn internal_names_match_trait_impl_self_type() {
        assert!(is_internal_name(
            "<threadwatch_capture::BacktraceCapturer as threadwatch_capture::StackCapturer>::capture",
            &[]
        ));
        assert!(is_internal_name("backtrace::backtrace::trace", &[]));
        assert!(is_internal_name("std::panicking::try", &["std::panicking"]));
        assert!(!is_internal_name("app::pool::add_worker", &[]));
    }

    #[test]
    fn fixed_depth_capturer_honors_limit() {
        let capturer = FixedDepthCapturer::new(10);
        assert_eq!(capturer.capture(3).len(), 3);
        assert_eq!(capturer.capture(20).len(), 10);
        assert_eq!(capturer.capture(3)[0].qualified_name, "synthetic::level_0");
    }
}

use std::sync::Arc;
use threadwatch::sink::RingBufferSink;
use threadwatch::{Dispatcher, FireOutcome, MaxStackDepth, ProbeDescriptor, ProbeRegistry, Reporter};

const POOL_TRIGGER: &str = "ThreadPoolExecutor.addWorker";

fn dispatcher_with_depth(depth: u32) -> (Dispatcher, Arc<RingBufferSink>) {
    let registry = Arc::new(ProbeRegistry::new());
    registry
        .register(
            ProbeDescriptor::new("pool.addWorker", POOL_TRIGGER)
                .unwrap()
                .with_max_stack_depth(MaxStackDepth::Bounded(depth)),
        )
        .unwrap();
    let sink = Arc::new(RingBufferSink::new(4));
    (Dispatcher::new(registry, Reporter::new(sink.clone())), sink)
}

fn frame_names(block: &str) -> Vec<String> {
    block
        .lines()
        .filter_map(|line| line.strip_prefix("    at "))
        .map(|frame| match frame.rfind(" (") {
            Some(pos) => frame[..pos].to_owned(),
            None => frame.to_owned(),
        })
        .collect()
}

#[inline(never)]
fn add_worker(dispatcher: &Dispatcher) -> FireOutcome {
    let outcome = dispatcher.fire(POOL_TRIGGER, "called");
    std::hint::black_box(outcome)
}

#[inline(never)]
fn grow_pool(dispatcher: &Dispatcher) -> FireOutcome {
    let outcome = add_worker(dispatcher);
    std::hint::black_box(outcome)
}

#[test]
fn first_frame_is_the_code_that_fired() {
    let (dispatcher, sink) = dispatcher_with_depth(8);
    assert_eq!(grow_pool(&dispatcher), FireOutcome::Reported);

    let names = frame_names(&sink.blocks()[0]);
    assert!(!names.is_empty());
    assert!(
        names[0].contains("add_worker"),
        "first frame should be the firing function, got {names:?}"
    );
    assert!(
        names[1].contains("grow_pool"),
        "second frame should be its caller, got {names:?}"
    );
}

#[test]
fn fire_path_frames_are_not_reported() {
    let (dispatcher, sink) = dispatcher_with_depth(15);
    assert_eq!(grow_pool(&dispatcher), FireOutcome::Reported);

    let names = frame_names(&sink.blocks()[0]);
    for name in &names {
        assert!(!name.contains("threadwatch::dispatch::"), "leaked {name} in {names:?}");
        assert!(!name.contains("threadwatch_capture::"), "leaked {name} in {names:?}");
        assert!(!name.starts_with("backtrace::"), "leaked {name} in {names:?}");
    }
}

use std::io;
use std::sync::Arc;
use std::thread;
use threadwatch::report::SEPARATOR;
use threadwatch::sink::RingBufferSink;
use threadwatch::{
    DispatchStats, Dispatcher, FireOutcome, FixedDepthCapturer, MaxStackDepth, ProbeDescriptor,
    ProbeRegistry, Reporter, Sink, SinkWriteError,
};

const POOL_TRIGGER: &str = "ThreadPoolExecutor.addWorker";

fn pool_registry() -> Arc<ProbeRegistry> {
    let registry = Arc::new(ProbeRegistry::new());
    registry
        .register(
            ProbeDescriptor::new("pool.addWorker", POOL_TRIGGER)
                .unwrap()
                .with_max_stack_depth(MaxStackDepth::Bounded(15)),
        )
        .unwrap();
    registry
}

/// Checks one rendered block and returns its frame count.
fn assert_well_formed(block: &str, probe_id: &str, message: &str) -> usize {
    let lines: Vec<&str> = block.lines().collect();
    assert!(lines.len() >= 2, "block too short: {block:?}");

    let header = lines[0];
    assert!(
        header.starts_with(&format!(">>> {probe_id}: {message} ")),
        "unexpected header {header:?}"
    );
    assert_eq!(*lines.last().unwrap(), SEPARATOR);

    let frames = &lines[1..lines.len() - 1];
    assert!(
        frames.iter().all(|line| line.starts_with("    at ")),
        "foreign line inside block: {block:?}"
    );
    assert!(
        header.contains(&format!("[frames={}]", frames.len())),
        "frame count mismatch in {block:?}"
    );
    frames.len()
}

#[test]
fn pool_add_worker_scenario() {
    let sink = Arc::new(RingBufferSink::new(8));
    let dispatcher = Dispatcher::new(pool_registry(), Reporter::new(sink.clone()));

    let outcome = dispatcher.fire(POOL_TRIGGER, "called");
    assert_eq!(outcome, FireOutcome::Reported);

    let blocks = sink.blocks();
    assert_eq!(blocks.len(), 1);
    let frames = assert_well_formed(&blocks[0], "pool.addWorker", "called");
    assert!(frames <= 15);
    assert!(blocks[0].ends_with(&format!("{SEPARATOR}\n")));
}

#[test]
fn concurrent_fires_produce_one_intact_block_each() {
    let sink = Arc::new(RingBufferSink::new(256));
    let dispatcher = Arc::new(
        Dispatcher::new(pool_registry(), Reporter::new(sink.clone()))
            .with_capturer(FixedDepthCapturer::new(40)),
    );

    thread::scope(|scope| {
        for _ in 0..100 {
            let dispatcher = &dispatcher;
            scope.spawn(move || {
                assert_eq!(
                    dispatcher.fire(POOL_TRIGGER, "called"),
                    FireOutcome::Reported
                );
            });
        }
    });

    let blocks = sink.blocks();
    assert_eq!(blocks.len(), 100);
    for block in &blocks {
        assert_eq!(assert_well_formed(block, "pool.addWorker", "called"), 15);
        assert!(block.lines().next().unwrap().ends_with("[truncated]"));
    }
    assert_eq!(
        dispatcher.stats(),
        DispatchStats {
            fired: 100,
            reported: 100,
            dropped: 0
        }
    );
}

#[test]
fn concurrent_fires_with_real_stacks_stay_intact() {
    let sink = Arc::new(RingBufferSink::new(64));
    let dispatcher = Arc::new(Dispatcher::new(pool_registry(), Reporter::new(sink.clone())));

    thread::scope(|scope| {
        for worker in 0..16 {
            let dispatcher = &dispatcher;
            scope.spawn(move || dispatcher.fire(POOL_TRIGGER, &format!("worker {worker}")));
        }
    });

    let blocks = sink.blocks();
    assert_eq!(blocks.len(), 16);
    for block in &blocks {
        let header = block.lines().next().unwrap();
        let message = header
            .strip_prefix(">>> pool.addWorker: ")
            .and_then(|rest| rest.split(" [").next())
            .unwrap();
        assert!(assert_well_formed(block, "pool.addWorker", message) <= 15);
    }
}

struct BrokenSink;

impl Sink for BrokenSink {
    fn write_block(&self, _block: &str) -> Result<(), SinkWriteError> {
        Err(SinkWriteError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "downstream went away",
        )))
    }
}

#[test]
fn failing_sink_never_reaches_the_caller() {
    let dispatcher = Dispatcher::new(pool_registry(), Reporter::new(Arc::new(BrokenSink)));

    let before = dispatcher.dropped_events();
    let outcome = dispatcher.fire(POOL_TRIGGER, "called");
    assert_eq!(outcome, FireOutcome::Dropped);
    assert_eq!(dispatcher.dropped_events(), before + 1);
    assert_eq!(dispatcher.stats().reported, 0);
}

//! Trigger points around thread creation.
//!
//! These are explicit `fire` insertion points for Rust code: route thread
//! creation through [`spawn_observed`] or an [`ObservedThreadFactory`] and
//! the matching probes report who asked for the thread.

use crate::dispatch::Dispatcher;
use crate::preset::{FACTORY_NEW_THREAD, THREAD_INIT, THREAD_START};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// Creates named threads on behalf of pools and services.
pub trait ThreadFactory: Send + Sync {
    fn new_thread(&self, name: &str, body: ThreadBody) -> io::Result<JoinHandle<()>>;
}

/// Factory backed by `std::thread::Builder`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdThreadFactory;

impl ThreadFactory for StdThreadFactory {
    fn new_thread(&self, name: &str, body: ThreadBody) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name(name.to_owned()).spawn(body)
    }
}

/// Wraps another factory and fires a trigger before every thread it creates.
pub struct ObservedThreadFactory<F = StdThreadFactory> {
    dispatcher: Arc<Dispatcher>,
    trigger_location: &'static str,
    inner: F,
}

impl ObservedThreadFactory<StdThreadFactory> {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self::wrapping(dispatcher, StdThreadFactory)
    }
}

impl<F: ThreadFactory> ObservedThreadFactory<F> {
    pub fn wrapping(dispatcher: Arc<Dispatcher>, inner: F) -> Self {
        Self {
            dispatcher,
            trigger_location: FACTORY_NEW_THREAD,
            inner,
        }
    }

    pub fn with_trigger_location(mut self, trigger_location: &'static str) -> Self {
        self.trigger_location = trigger_location;
        self
    }
}

impl<F: ThreadFactory> ThreadFactory for ObservedThreadFactory<F> {
    fn new_thread(&self, name: &str, body: ThreadBody) -> io::Result<JoinHandle<()>> {
        self.dispatcher
            .fire_with(self.trigger_location, || format!("newThread({name}) called"));
        self.inner.new_thread(name, body)
    }
}

/// Spawns a named thread, firing the thread-construction trigger before the
/// builder is created and the thread-start trigger right before the spawn.
pub fn spawn_observed<T, F>(
    dispatcher: &Dispatcher,
    name: &str,
    f: F,
) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    dispatcher.fire_with(THREAD_INIT, || format!("new thread constructed: {name}"));
    let builder = thread::Builder::new().name(name.to_owned());
    dispatcher.fire_with(THREAD_START, || format!("thread started: {name}"));
    builder.spawn(f)
}

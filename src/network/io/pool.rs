use super::engine::{Direction, Engine};
use crate::network::core::handle::DivertHandle;
use crate::sys::Driver;
use crossbeam::queue::SegQueue;
use log::debug;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Free list of idle engines for one direction.
///
/// The pool grows to the number of operations in flight at once and is
/// closed irreversibly when the service is disposed. Closing aborts every
/// operation still in flight. Engines released into a closed pool are
/// disposed instead of stored.
pub struct OperationPool<D: Driver> {
    direction: Direction,
    handle: Arc<DivertHandle<D>>,
    idle: SegQueue<Arc<Engine<D>>>,
    closed: AtomicBool,
    created: AtomicUsize,
    engines: Mutex<Vec<Weak<Engine<D>>>>,
}

impl<D: Driver> OperationPool<D> {
    pub fn new(direction: Direction, handle: Arc<DivertHandle<D>>) -> Arc<Self> {
        Arc::new(Self {
            direction,
            handle,
            idle: SegQueue::new(),
            closed: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            engines: Mutex::new(Vec::new()),
        })
    }

    /// Takes an idle engine or creates a new one.
    pub fn acquire(self: &Arc<Self>) -> Arc<Engine<D>> {
        if let Some(engine) = self.idle.pop() {
            return engine;
        }
        let total = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Creating {:?} engine #{}", self.direction, total);
        let engine = Arc::new(Engine::new(
            self.direction,
            Arc::clone(&self.handle),
            Arc::downgrade(self),
        ));
        let mut engines = self.engines.lock().unwrap_or_else(PoisonError::into_inner);
        engines.retain(|engine| engine.strong_count() > 0);
        engines.push(Arc::downgrade(&engine));
        engine
    }

    /// Returns an engine to the pool.
    pub fn release(&self, engine: Arc<Engine<D>>) {
        if self.closed.load(Ordering::SeqCst) {
            engine.dispose();
            return;
        }
        self.idle.push(engine);
        // close() may have drained between the check and the push.
        fence(Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.drain();
        }
    }

    /// Closes the pool, disposes every idle engine and aborts the rest.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            fence(Ordering::SeqCst);
            let disposed = self.drain();
            let live: Vec<_> = self
                .engines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .filter_map(|engine| engine.upgrade())
                .collect();
            for engine in &live {
                engine.abort();
            }
            debug!(
                "Closed {:?} pool, disposed {} idle engines, aborted {} in use",
                self.direction,
                disposed,
                live.len()
            );
        }
    }

    fn drain(&self) -> usize {
        let mut disposed = 0;
        while let Some(engine) = self.idle.pop() {
            engine.dispose();
            disposed += 1;
        }
        disposed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of idle engines.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Number of engines ever created by this pool.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

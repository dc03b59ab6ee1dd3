use std::{panic::{catch_unwind, AssertUnwindSafe}, sync::{Arc, Weak}, thread};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::error::{from_panic, ExecError};

use super::{ring::RingBuffer, signal::{CancellationToken, Latch}};

/// Work scheduled on a dispatcher. The argument is the number of messages the
/// function may handle before it should give the worker back.
pub type ScheduleFn = Box<dyn FnOnce(usize) + Send>;

pub trait Dispatcher: Send + Sync {
    fn schedule(&self, f: ScheduleFn);
}

const INITIAL_QUEUE_CAPACITY: usize = 100;

#[derive(Default)]
struct PoolState {
    // collapses any number of schedule calls into one wakeup
    posted: bool,
    stopped: bool,
    running: usize,
}

struct Shared {
    throughput: usize,
    work: Mutex<RingBuffer<ScheduleFn>>,
    state: Mutex<PoolState>,
    work_cv: Condvar,
    exit_cv: Condvar,
    err: Mutex<Option<ExecError>>,
    err_latch: Latch,
}

/// A fixed pool of worker threads draining one shared work queue.
#[derive(Clone)]
pub struct PoolDispatcher {
    shared: Arc<Shared>,
}

impl PoolDispatcher {
    pub fn new(throughput: usize) -> PoolDispatcher {
        PoolDispatcher {
            shared: Arc::new(Shared {
                throughput: throughput.max(1),
                work: Mutex::new(RingBuffer::with_capacity(INITIAL_QUEUE_CAPACITY)),
                state: Mutex::new(PoolState::default()),
                work_cv: Condvar::new(),
                exit_cv: Condvar::new(),
                err: Mutex::new(None),
                err_latch: Latch::new(),
            }),
        }
    }

    /// Starts `workers` threads. They run until [`PoolDispatcher::stop`] is called,
    /// the token is cancelled or a scheduled function panics.
    pub fn start(&self, workers: usize, cancel: &CancellationToken) -> Result<(), ExecError> {
        info!(workers, throughput = self.shared.throughput, "starting dispatcher");
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        cancel.on_cancel(move || {
            if let Some(shared) = weak.upgrade() {
                let _state = shared.state.lock();
                shared.work_cv.notify_all();
            }
        });

        for i in 0..workers {
            self.shared.state.lock().running += 1;
            let (shared, cancel) = (self.shared.clone(), cancel.clone());
            let spawned = thread::Builder::new()
                .name(format!("oxid-flow-worker-{}", i))
                .spawn(move || shared.run(&cancel));
            if let Err(e) = spawned {
                self.shared.worker_exited();
                return Err(ExecError::internal(format!("failed to start dispatcher worker: {}", e)));
            }
        }
        Ok(())
    }

    /// Stops the workers and waits for all of them to exit. Returns the first error
    /// recorded by any worker. Safe to call more than once.
    pub fn stop(&self) -> Result<(), ExecError> {
        {
            let mut state = self.shared.state.lock();
            if !state.stopped {
                state.stopped = true;
                self.shared.work_cv.notify_all();
            }
            while state.running > 0 {
                self.shared.exit_cv.wait(&mut state);
            }
        }
        // Queued work holds the edges it would drain, and they hold this dispatcher.
        // Nobody runs it anymore, so release it outside the locks.
        let abandoned = std::mem::replace(&mut *self.shared.work.lock(), RingBuffer::with_capacity(0));
        debug!(abandoned = abandoned.len(), "dispatcher stopped");
        drop(abandoned);
        match self.shared.err.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Fires once a worker recorded an error.
    pub fn err_latch(&self) -> &Latch {
        &self.shared.err_latch
    }

    pub fn err(&self) -> Option<ExecError> {
        self.shared.err.lock().clone()
    }

    pub fn queued(&self) -> usize {
        self.shared.work.lock().len()
    }
}

impl Dispatcher for PoolDispatcher {
    fn schedule(&self, f: ScheduleFn) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            drop(state);
            drop(f);
            return;
        }
        // pushed under the state lock so that stop() can't miss it
        self.shared.work.lock().push(f);
        if !state.posted {
            state.posted = true;
            self.shared.work_cv.notify_one();
        }
    }
}

impl Shared {
    fn run(&self, cancel: &CancellationToken) {
        loop {
            {
                let mut state = self.state.lock();
                while !state.posted && !state.stopped && !cancel.is_cancelled() {
                    self.work_cv.wait(&mut state);
                }
                if state.stopped || cancel.is_cancelled() {
                    break;
                }
                state.posted = false;
            }
            if let Err(err) = self.do_work(cancel) {
                error!(error = %err, stack = err.stack().unwrap_or_default(), "dispatcher worker panicked");
                self.set_err(err);
                break;
            }
        }
        self.worker_exited();
    }

    fn do_work(&self, cancel: &CancellationToken) -> Result<(), ExecError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let f = match self.work.lock().pop() {
                Some(f) => f,
                None => return Ok(()),
            };
            let throughput = self.throughput;
            catch_unwind(AssertUnwindSafe(move || f(throughput))).map_err(from_panic)?;
        }
    }

    fn set_err(&self, err: ExecError) {
        {
            let mut slot = self.err.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(err);
        }
        self.err_latch.fire();
    }

    fn worker_exited(&self) {
        let mut state = self.state.lock();
        state.running -= 1;
        if state.running == 0 {
            self.exit_cv.notify_all();
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::atomic::{AtomicUsize, Ordering}, time::Duration};

    use super::*;

    #[test]
    fn test_runs_scheduled_work() {
        let d = PoolDispatcher::new(10);
        let cancel = CancellationToken::new();
        d.start(4, &cancel).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let done = Latch::new();
        for _ in 0..1000 {
            let (count, done) = (count.clone(), done.clone());
            d.schedule(Box::new(move |throughput| {
                assert_eq!(throughput, 10);
                if count.fetch_add(1, Ordering::SeqCst) + 1 == 1000 {
                    done.fire();
                }
            }));
        }
        assert!(done.wait_timeout(Duration::from_secs(10)));
        d.stop().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let d = PoolDispatcher::new(10);
        let cancel = CancellationToken::new();
        d.start(3, &cancel).unwrap();
        d.schedule(Box::new(|_| panic!("expected")));
        assert!(d.err_latch().wait_timeout(Duration::from_secs(10)));

        for _ in 0..10 {
            let err = d.stop().unwrap_err();
            assert_eq!(err.to_string(), "panic: expected");
        }
    }

    #[test]
    fn test_panic_after_cancel() {
        let d = PoolDispatcher::new(10);
        let cancel = CancellationToken::new();
        d.start(10, &cancel).unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let (cancel, started) = (cancel.clone(), started.clone());
            d.schedule(Box::new(move |_| {
                started.fetch_add(1, Ordering::SeqCst);
                cancel.wait_cancelled();
                panic!("expected");
            }));
        }
        while started.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        cancel.cancel();

        let err = d.stop().unwrap_err();
        assert_eq!(err.to_string(), "panic: expected");
        assert!(matches!(err, ExecError::Internal { stack: Some(_), .. }));
    }

    #[test]
    fn test_resource_exhausted_panic_kept() {
        let d = PoolDispatcher::new(1);
        let cancel = CancellationToken::new();
        d.start(1, &cancel).unwrap();
        d.schedule(Box::new(|_| std::panic::panic_any(ExecError::ResourceExhausted("quota".to_string()))));
        assert!(d.err_latch().wait_timeout(Duration::from_secs(10)));
        assert!(d.stop().unwrap_err().is_resource_exhausted());
    }

    #[test]
    fn test_stop_without_start() {
        let d = PoolDispatcher::new(1);
        d.schedule(Box::new(|_| {}));
        assert_eq!(d.queued(), 1);
        d.stop().unwrap();
        assert_eq!(d.queued(), 0);
    }

    #[test]
    fn test_stop_releases_queued_work() {
        let d = PoolDispatcher::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        d.start(2, &cancel).unwrap();

        let held = Arc::new(());
        let captured = held.clone();
        d.schedule(Box::new(move |_| drop(captured)));
        d.stop().unwrap();
        assert_eq!(Arc::strong_count(&held), 1);

        // work scheduled after stop is dropped right away
        let captured = held.clone();
        d.schedule(Box::new(move |_| drop(captured)));
        assert_eq!(d.queued(), 0);
        assert_eq!(Arc::strong_count(&held), 1);
    }
}

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::error::ExecError;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct LatchState {
    fired: bool,
    callbacks: Vec<Callback>,
}

/// One-shot signal. Once fired it stays fired.
#[derive(Clone, Default)]
pub struct Latch {
    inner: Arc<(Mutex<LatchState>, Condvar)>,
}

impl Latch {
    pub fn new() -> Latch {
        Latch::default()
    }

    /// Fires the latch. Returns false if it had already been fired.
    pub fn fire(&self) -> bool {
        let (state, cv) = &*self.inner;
        let callbacks = {
            let mut state = state.lock();
            if state.fired {
                return false;
            }
            state.fired = true;
            std::mem::take(&mut state.callbacks)
        };
        cv.notify_all();
        // callbacks run outside the lock, they may touch other latches
        for cb in callbacks {
            cb();
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        self.inner.0.lock().fired
    }

    pub fn wait(&self) {
        let (state, cv) = &*self.inner;
        let mut state = state.lock();
        while !state.fired {
            cv.wait(&mut state);
        }
    }

    /// Waits at most `timeout`. Returns whether the latch fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (state, cv) = &*self.inner;
        let mut state = state.lock();
        if !state.fired {
            cv.wait_for(&mut state, timeout);
        }
        state.fired
    }

    /// Runs `f` once the latch fires, immediately if it already has.
    pub fn on_fire(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.0.lock();
        if state.fired {
            drop(state);
            f();
        } else {
            state.callbacks.push(Box::new(f));
        }
    }
}

/// A wakeup counter. Waiters remember the generation they saw last and sleep until it moves.
#[derive(Clone, Default)]
pub struct Notify {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl Notify {
    pub fn new() -> Notify {
        Notify::default()
    }

    pub fn notify(&self) {
        let (generation, cv) = &*self.inner;
        *generation.lock() += 1;
        cv.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self.inner.0.lock()
    }

    pub fn wait_for(&self, seen: u64) -> u64 {
        let (generation, cv) = &*self.inner;
        let mut generation = generation.lock();
        while *generation == seen {
            cv.wait(&mut generation);
        }
        *generation
    }
}

/// Cancellation shared by everything that belongs to one execution.
#[derive(Clone, Default)]
pub struct CancellationToken {
    latch: Latch,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.latch.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.latch.is_fired()
    }

    pub fn check(&self) -> Result<(), ExecError> {
        if self.is_cancelled() {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn wait_cancelled(&self) {
        self.latch.wait()
    }

    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        self.latch.on_fire(f)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_latch_fires_once() {
        let latch = Latch::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        latch.on_fire(move || { c.fetch_add(1, Ordering::SeqCst); });
        assert!(latch.fire());
        assert!(!latch.fire());
        let c = calls.clone();
        latch.on_fire(move || { c.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        latch.wait();
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancellationToken::new();
        let t = token.clone();
        let handle = std::thread::spawn(move || {
            t.wait_cancelled();
            t.check()
        });
        token.cancel();
        assert!(matches!(handle.join().unwrap(), Err(ExecError::Cancelled)));
    }

    #[test]
    fn test_notify_generation() {
        let notify = Notify::new();
        let seen = notify.generation();
        let n = notify.clone();
        let handle = std::thread::spawn(move || n.wait_for(seen));
        notify.notify();
        assert!(handle.join().unwrap() > seen);
    }
}

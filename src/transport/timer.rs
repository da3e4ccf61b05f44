//! # One-Shot Timer
//!
//! A small re-armable timer used for the power-save grace period and the
//! receive-replenish retry. Each timer owns one background thread that parks
//! on a condition variable until a deadline is armed.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// A re-armable one-shot timer.
///
/// [`OneshotTimer::arm`] (re)starts the countdown, [`OneshotTimer::cancel`]
/// stops a pending one. The callback runs on the timer's own thread, without
/// any timer lock held.
///
/// A cancel that races with an already-expired deadline may still see the
/// callback run; callbacks therefore have to re-validate their trigger
/// condition under their own lock. This mirrors the semantics of the kernel
/// timers this component replaces.
pub struct OneshotTimer {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    callback: Box<dyn Fn() + Send + Sync>,
}

struct State {
    deadline: Option<Instant>,
    shutdown: bool,
}

impl std::fmt::Debug for OneshotTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("OneshotTimer")
            .field("armed", &state.deadline.is_some())
            .finish()
    }
}

impl OneshotTimer {
    /// Create a timer whose expiry runs `callback` on a thread named `name`.
    #[must_use]
    pub fn new(name: &str, callback: impl Fn() + Send + Sync + 'static) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                deadline: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
            callback: Box::new(callback),
        });

        let worker = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || Self::run(&inner))
                .expect("failed to spawn timer thread")
        };

        Self {
            inner,
            worker: Some(worker),
        }
    }

    /// Start the countdown; a pending deadline is replaced.
    pub fn arm(&self, delay: std::time::Duration) {
        let mut state = self.inner.state.lock().unwrap();
        state.deadline = Some(Instant::now() + delay);
        self.inner.cond.notify_all();
    }

    /// Drop a pending deadline, if any.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.deadline = None;
        self.inner.cond.notify_all();
    }

    fn run(inner: &Inner) {
        let mut state = inner.state.lock().unwrap();
        loop {
            if state.shutdown {
                return;
            }

            match state.deadline {
                None => state = inner.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now < deadline {
                        state = inner
                            .cond
                            .wait_timeout(state, deadline - now)
                            .unwrap()
                            .0;
                    } else {
                        state.deadline = None;
                        drop(state);
                        (inner.callback)();
                        state = inner.state.lock().unwrap();
                    }
                }
            }
        }
    }
}

impl Drop for OneshotTimer {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            self.inner.cond.notify_all();
        }

        if let Some(worker) = self.worker.take() {
            // A panicking callback already poisoned the timer; nothing
            // useful to do about it during drop.
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_timer() -> (OneshotTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = {
            let fired = Arc::clone(&fired);
            OneshotTimer::new("test-timer", move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        (timer, fired)
    }

    #[test]
    fn fires_once_after_delay() {
        let (timer, fired) = counting_timer();

        timer.arm(Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_expiry() {
        let (timer, fired) = counting_timer();

        timer.arm(Duration::from_millis(30));
        timer.cancel();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearm_restarts_the_countdown() {
        let (timer, fired) = counting_timer();

        timer.arm(Duration::from_millis(40));
        thread::sleep(Duration::from_millis(20));
        timer.arm(Duration::from_millis(200));
        thread::sleep(Duration::from_millis(40));

        // The original deadline has long passed but the re-arm replaced it.
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_with_pending_deadline_does_not_hang() {
        let (timer, _fired) = counting_timer();
        timer.arm(Duration::from_secs(3600));
        drop(timer);
    }
}

//! The scheduler/timer collaborator.
//!
//! The write-behind worker and the read-ahead worker are both long-lived
//! background threads parked on a condition variable, matching the "prefer
//! explicit shutdown signaling over cancellation exceptions" design note.
//! [`Ticker`] stands in for `timer_ticks`/`timer_sleep`: rather than wiring
//! real wall-clock sleeps into every test, a background worker's "tick
//! period" is expressed in ticks of this counter, which a test can drive by
//! hand or let free-run on a short real interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A monotonic tick counter, advanced either by a real-time thread or by a
/// test harness calling [`Ticker::advance`] directly.
#[derive(Default)]
pub struct Ticker {
    ticks: AtomicU64,
}

impl Ticker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn advance(&self, by: u64) -> u64 {
        self.ticks.fetch_add(by, Ordering::SeqCst) + by
    }
}

/// A background worker that performs `tick()` every `period` real-time
/// ticks (here, milliseconds) until told to stop, then performs one final
/// `tick()` before exiting — the write-behind task's "on shutdown it
/// performs one final flush and signals completion".
pub struct PeriodicWorker {
    stop: Arc<AtomicBool>,
    done: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicWorker {
    /// Spawns the worker. `tick` runs on every period and once more after
    /// shutdown is requested.
    pub fn spawn(name: &'static str, period: Duration, mut tick: impl FnMut() + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_clone = stop.clone();
        let done_clone = done.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !stop_clone.load(Ordering::SeqCst) {
                    std::thread::sleep(period);
                    tick();
                }
                tick();
                let (lock, cvar) = &*done_clone;
                *lock.lock().unwrap() = true;
                cvar.notify_all();
            })
            .expect("failed to spawn periodic worker");
        PeriodicWorker {
            stop,
            done,
            handle: Some(handle),
        }
    }

    /// Signals shutdown and blocks until the worker's final tick has run.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let (lock, cvar) = &*self.done;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cvar.wait(done).unwrap();
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn periodic_worker_ticks_until_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let worker = PeriodicWorker::spawn("test-ticker", Duration::from_millis(5), move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(30));
        worker.shutdown();
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}

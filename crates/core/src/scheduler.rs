//! Periodic processing for RTP engines.
//!
//! An engine implements [`Module`] to get called back for timed work such as
//! RTCP sender reports. [`TaskRunner`] is a single-thread [`Scheduler`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

/// A unit of periodic work.
pub trait Module: Send + Sync {
    /// Time until [`process`](Self::process) should run next.
    fn time_until_next_process(&self) -> Duration;

    fn process(&self);
}

pub trait Scheduler: Send + Sync {
    fn register_module(&self, module: Arc<dyn Module>);

    /// Remove a module previously registered. Unknown modules are ignored.
    fn deregister_module(&self, module: &Arc<dyn Module>);
}

/// Bounds on how long the runner sleeps between checks.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Drives registered modules from one background thread.
///
/// The thread wakes at most every 50 ms, calls `process()` on every module
/// whose `time_until_next_process()` is zero, then sleeps until the next one
/// is due. [`stop`](Self::stop) joins the thread.
pub struct TaskRunner {
    modules: Arc<RwLock<Vec<Arc<dyn Module>>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self {
            modules: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Start the processing thread. No-op when already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let modules = self.modules.clone();
        let running = self.running.clone();
        let handle = thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                let next = process_due(&modules);
                thread::sleep(next.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL));
            }
            tracing::debug!("task runner exited");
        });
        *self.handle.lock() = Some(handle);
        tracing::debug!("task runner started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        // Stopped from inside process(): the loop exits on its next check.
        if handle.thread().id() == thread::current().id() {
            tracing::debug!("task runner stopped from its own thread");
        } else if handle.join().is_err() {
            tracing::warn!("task runner thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn module_count(&self) -> usize {
        self.modules.read().len()
    }
}

/// Run every due module once and return the wait until the next one.
fn process_due(modules: &RwLock<Vec<Arc<dyn Module>>>) -> Duration {
    // Snapshot so modules can (de)register from inside process().
    let snapshot: Vec<Arc<dyn Module>> = modules.read().clone();
    let mut next = MAX_POLL_INTERVAL;
    for module in &snapshot {
        if module.time_until_next_process().is_zero() {
            module.process();
        }
        next = next.min(module.time_until_next_process());
    }
    next
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Scheduler for TaskRunner {
    fn register_module(&self, module: Arc<dyn Module>) {
        let mut modules = self.modules.write();
        if !modules.iter().any(|m| Arc::ptr_eq(m, &module)) {
            modules.push(module);
        }
    }

    fn deregister_module(&self, module: &Arc<dyn Module>) {
        self.modules.write().retain(|m| !Arc::ptr_eq(m, module));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct Ticker {
        calls: AtomicUsize,
    }

    impl Module for Ticker {
        fn time_until_next_process(&self) -> Duration {
            Duration::ZERO
        }

        fn process(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Idle;

    impl Module for Idle {
        fn time_until_next_process(&self) -> Duration {
            Duration::from_secs(3600)
        }

        fn process(&self) {
            panic!("idle module must not run");
        }
    }

    #[test]
    fn register_is_deduplicated() {
        let runner = TaskRunner::new();
        let module: Arc<dyn Module> = Arc::new(Ticker::default());
        runner.register_module(module.clone());
        runner.register_module(module.clone());
        assert_eq!(runner.module_count(), 1);

        runner.deregister_module(&module);
        runner.deregister_module(&module);
        assert_eq!(runner.module_count(), 0);
    }

    #[test]
    fn process_due_skips_idle_modules() {
        let modules = RwLock::new(vec![
            Arc::new(Idle) as Arc<dyn Module>,
            Arc::new(Ticker::default()) as Arc<dyn Module>,
        ]);
        let next = process_due(&modules);
        assert_eq!(next, Duration::ZERO);
    }

    #[test]
    fn runner_processes_due_modules() {
        let runner = TaskRunner::new();
        let ticker = Arc::new(Ticker::default());
        runner.register_module(ticker.clone());
        runner.start();
        assert!(runner.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticker.calls.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        runner.stop();
        assert!(!runner.is_running());
        assert!(ticker.calls.load(Ordering::SeqCst) >= 3);
    }
}

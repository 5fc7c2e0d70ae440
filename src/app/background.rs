use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

/// Handle to a periodic worker thread. Dropping it stops the worker.
pub struct LoopHandle {
    name: String,
    stop_flag: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl LoopHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!(worker = %self.name, "background worker exited abnormally");
            }
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs `tick` every `interval` until stopped. A panicking tick is logged and
/// the loop carries on with the next interval.
pub fn spawn_loop<F>(name: &str, interval: Duration, mut tick: F) -> LoopHandle
where
    F: FnMut() + Send + 'static,
{
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_thread = Arc::clone(&stop_flag);
    let worker = name.to_string();

    let join = thread::Builder::new()
        .name(format!("droidbench-{name}"))
        .spawn(move || {
            debug!(worker = %worker, "background worker started");
            while !stop_thread.load(Ordering::Relaxed) {
                if catch_unwind(AssertUnwindSafe(&mut tick)).is_err() {
                    warn!(worker = %worker, "background tick panicked; retrying next interval");
                }
                sleep_with_stop(interval, &stop_thread);
            }
            debug!(worker = %worker, "background worker stopped");
        })
        .ok();

    if join.is_none() {
        warn!(worker = %name, "failed to spawn background worker");
    }

    LoopHandle {
        name: name.to_string(),
        stop_flag,
        join,
    }
}

pub fn sleep_with_stop(duration: Duration, stop_flag: &AtomicBool) {
    let mut remaining = duration;
    let chunk = Duration::from_millis(50);
    while !remaining.is_zero() {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        let step = remaining.min(chunk);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn loop_keeps_running_after_a_panicking_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_loop("test-panics", Duration::from_millis(10), move || {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            if count == 0 {
                panic!("first tick fails");
            }
        });

        let start = Instant::now();
        while ticks.load(Ordering::SeqCst) < 3 && start.elapsed() < Duration::from_secs(3) {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.is_running());
        handle.stop();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn stop_returns_promptly_during_long_interval() {
        let handle = spawn_loop("test-stop", Duration::from_secs(30), || {});
        let start = Instant::now();
        handle.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}

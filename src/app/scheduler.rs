use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// One mutex per device serial. Start/stop on a device hold its lock so
/// conflict checks and process bookkeeping never interleave.
#[derive(Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut guard = relock(&self.locks);
        guard
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        relock(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Locks `mutex`, taking over a poisoned lock. The guarded data here is
/// bookkeeping that stays consistent even if a holder panicked.
pub fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn device_lock_serializes_same_device() {
        let locks = Arc::new(DeviceLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let overlap = Arc::clone(&overlap);
                thread::spawn(move || {
                    let lock = locks.device_lock("ABC");
                    let _guard = relock(&lock);
                    if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(20));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn different_devices_get_different_locks() {
        let locks = DeviceLocks::new();
        let first = locks.device_lock("A");
        let second = locks.device_lock("B");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &locks.device_lock("A")));
    }
}

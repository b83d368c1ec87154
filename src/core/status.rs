use std::sync::atomic::{AtomicBool, Ordering};

/// Global readiness flag, set once the first full reconcile pass has finished.
///
/// The readiness probe uses it to tell "running but never synced" apart from
/// "synced at least once", regardless of whether individual upstreams failed.
static FIRST_PASS_DONE: AtomicBool = AtomicBool::new(false);

/// Mark the service as ready after a completed reconcile pass.
pub fn mark_synced() {
    if !FIRST_PASS_DONE.swap(true, Ordering::SeqCst) {
        log::info!("First reconcile pass completed, service is ready");
    }
}

/// Returns true once at least one reconcile pass has completed.
pub fn is_ready() -> bool {
    FIRST_PASS_DONE.load(Ordering::SeqCst)
}

/// Reset readiness status (useful for testing)
#[allow(dead_code)]
pub fn reset() {
    FIRST_PASS_DONE.store(false, Ordering::SeqCst);
    log::debug!("Readiness status reset");
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Mutex, MutexGuard};

    use super::*;

    // These tests touch process-wide state, serialize them.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    /// Holds the readiness flag for the calling test. A test that panicked while
    /// holding it does not fail the ones after it.
    pub(crate) fn serial() -> MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_initial_state_not_ready() {
        let _guard = serial();
        reset();
        assert!(!is_ready());
    }

    #[test]
    fn test_mark_synced() {
        let _guard = serial();
        reset();
        assert!(!is_ready());
        mark_synced();
        assert!(is_ready());
    }

    #[test]
    fn test_multiple_marks_stay_ready() {
        let _guard = serial();
        reset();
        mark_synced();
        mark_synced();
        assert!(is_ready());
    }

    #[test]
    fn test_lock_survives_panicking_holder() {
        let holder = std::thread::spawn(|| {
            let _guard = serial();
            panic!("readiness check failed while holding the lock");
        });
        assert!(holder.join().is_err());

        let _guard = serial();
        reset();
        mark_synced();
        assert!(is_ready());
    }
}

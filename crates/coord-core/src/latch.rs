use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Gate that background workers observe before entering their first pass.
///
/// Starts `Ready`. Each active registration flips `Ready` to false; the
/// last matching release flips it back. Safe under arbitrary concurrent
/// register/release per the outer spec's §5 shared-resource policy.
#[derive(Debug, Clone)]
pub struct StartupLatch {
    inner: Arc<AtomicI64>,
}

impl Default for StartupLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupLatch {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.load(Ordering::SeqCst) <= 0
    }

    /// Register one active step; returns a handle whose `release` (or drop)
    /// decrements the count. Release is idempotent.
    pub fn register(&self, _step_name: &str) -> LatchHandle {
        self.inner.fetch_add(1, Ordering::SeqCst);
        LatchHandle {
            inner: self.inner.clone(),
            released: false,
        }
    }
}

pub struct LatchHandle {
    inner: Arc<AtomicI64>,
    released: bool,
}

impl LatchHandle {
    pub fn release(&mut self) {
        if !self.released {
            self.inner.fetch_sub(1, Ordering::SeqCst);
            self.released = true;
        }
    }
}

impl Drop for LatchHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_ready() {
        let latch = StartupLatch::new();
        assert!(latch.is_ready());
    }

    #[test]
    fn registration_blocks_until_released() {
        let latch = StartupLatch::new();
        let mut h1 = latch.register("ensure_outbox_schema");
        assert!(!latch.is_ready());
        let h2 = latch.register("ensure_inbox_schema");
        assert!(!latch.is_ready());

        h1.release();
        assert!(!latch.is_ready());

        drop(h2);
        assert!(latch.is_ready());
    }

    #[test]
    fn release_is_idempotent() {
        let latch = StartupLatch::new();
        let mut h = latch.register("step");
        h.release();
        h.release();
        assert!(latch.is_ready());
    }

    #[test]
    fn concurrent_register_release_converges() {
        use std::thread;

        let latch = StartupLatch::new();
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || {
                    let h = latch.register("step");
                    drop(h);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(latch.is_ready());
    }
}

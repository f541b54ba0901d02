//! Cooperative cancellation for hardware poll loops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Flags {
    terminate: AtomicBool,
    interrupt_generation: AtomicU64,
}

/// Token checked at every poll iteration of a running request.
///
/// All clones share the same flags. [`CancellationToken::interrupt`] cancels
/// every request scoped before the call; requests scoped afterwards run
/// normally. [`CancellationToken::terminate`] cancels everything, permanently.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flags: Arc<Flags>,
    generation: u64,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for one request, interrupted by any `interrupt()` issued after this call.
    pub fn scoped(&self) -> Self {
        Self {
            flags: Arc::clone(&self.flags),
            generation: self.flags.interrupt_generation.load(Ordering::SeqCst),
        }
    }

    /// Cancel all requests scoped so far.
    pub fn interrupt(&self) {
        self.flags.interrupt_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Cancel everything; used at shutdown.
    pub fn terminate(&self) {
        self.flags.terminate.store(true, Ordering::SeqCst);
    }

    pub fn terminate_requested(&self) -> bool {
        self.flags.terminate.load(Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.terminate_requested()
            || self.flags.interrupt_generation.load(Ordering::SeqCst) > self.generation
    }

    /// Sleep for `duration` in slices of at most `slice`, returning early
    /// (with `false`) as soon as the token is interrupted.
    pub fn sleep(&self, duration: Duration, slice: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let slice = slice.max(Duration::from_millis(1));
        loop {
            if self.is_interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(slice.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_only_affects_earlier_scopes() {
        let root = CancellationToken::new();
        let before = root.scoped();
        root.interrupt();
        let after = root.scoped();
        assert!(before.is_interrupted());
        assert!(!after.is_interrupted());
        assert!(!root.terminate_requested());
    }

    #[test]
    fn test_terminate_affects_everyone() {
        let root = CancellationToken::new();
        let scoped = root.scoped();
        root.terminate();
        assert!(scoped.is_interrupted());
        assert!(root.scoped().is_interrupted());
    }

    #[test]
    fn test_sleep_returns_early_on_interrupt() {
        let root = CancellationToken::new();
        let scoped = root.scoped();
        let waker = root.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            waker.interrupt();
        });
        let start = Instant::now();
        let completed = scoped.sleep(Duration::from_secs(5), Duration::from_millis(10));
        handle.join().unwrap();
        assert!(!completed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// A cancellation flag shared between the thread requesting cancellation and the thread
/// observing it.
///
/// Cloning a [Flag] yields a handle to the same underlying flag. Setting is idempotent and never
/// blocks; observers check [Flag::is_set] at their own checkpoints.
#[derive(Debug, Clone, Default)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking every `tick` to check the flag.
    ///
    /// Returns `true` if the flag was set before the full duration elapsed.
    pub fn sleep(&self, duration: Duration, tick: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(tick.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = Flag::new();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.set();
        assert!(other.is_set());
        other.clear();
        assert!(!flag.is_set());
    }

    #[test]
    fn sleep_runs_full_duration_when_unset() {
        let flag = Flag::new();
        let start = Instant::now();
        assert!(!flag.sleep(Duration::from_millis(50), Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn sleep_wakes_when_set() {
        let flag = Flag::new();
        let setter = flag.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            setter.set();
        });
        let start = Instant::now();
        assert!(flag.sleep(Duration::from_secs(10), Duration::from_millis(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }
}

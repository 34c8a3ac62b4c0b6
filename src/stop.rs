/// Cooperative shutdown signal shared between the supervisor loop and the
/// context that receives the stop request (service control handler or
/// console Ctrl-C handler).
///
/// One-shot: once set it stays set. Every delay in the supervisor loop is a
/// wait on this signal rather than a plain sleep, so a stop request
/// interrupts the loop within one wait interval.
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Request shutdown. Idempotent; safe to call from any thread.
    pub fn set(&self) {
        let mut stopped = self.lock();
        *stopped = true;
        self.cond.notify_all();
    }

    /// Whether shutdown has been requested.
    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Wait up to `timeout` for the signal. Returns true if shutdown has
    /// been requested, false if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.lock();
        loop {
            if *stopped {
                return true;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return false,
            };
            stopped = match self.cond.wait_timeout(stopped, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        match self.stopped.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_starts_unset() {
        let signal = StopSignal::new();
        assert!(!signal.is_set());
    }

    #[test]
    fn test_set_is_idempotent() {
        let signal = StopSignal::new();
        signal.set();
        signal.set();
        assert!(signal.is_set());
    }

    #[test]
    fn test_wait_times_out_when_unset() {
        let signal = StopSignal::new();
        let start = Instant::now();
        let stopped = signal.wait_timeout(Duration::from_millis(50));
        assert!(!stopped);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_returns_immediately_when_already_set() {
        let signal = StopSignal::new();
        signal.set();
        let start = Instant::now();
        assert!(signal.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_set_from_other_thread_interrupts_wait() {
        let signal = Arc::new(StopSignal::new());
        let setter = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                signal.set();
            })
        };

        let start = Instant::now();
        let stopped = signal.wait_timeout(Duration::from_secs(30));
        setter.join().unwrap();

        assert!(stopped);
        // Interrupted well before the full timeout.
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

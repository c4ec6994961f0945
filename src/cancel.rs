use std::fmt;
use std::io;
use std::thread;
use std::time::Duration;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use log::debug;

/// Why a [`CancellationSignal`] fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    TimedOut(Duration),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested =>
                write!(f, "cancellation requested"),
            CancelReason::TimedOut(delay) =>
                write!(f, "timed out after {:?}", delay),
        }
    }
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: OnceLock<CancelReason>,
}

/// Shared one-way flag polled by workers before each item.
///
/// Clones observe the same flag. Only the first trigger takes effect.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    pub fn new() -> CancellationSignal {
        CancellationSignal::default()
    }

    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::Requested)
    }

    /// Returns `false` if the signal had already fired.
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        if self.inner.reason.set(reason).is_err() {
            return false;
        }
        self.inner.cancelled.store(true, Ordering::Release);
        debug!("cancellation signal fired: {}", reason);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.get().copied()
    }

    /// Fires the signal with [`CancelReason::TimedOut`] once `delay` has
    /// elapsed, unless the returned timer is dropped first.
    pub fn cancel_after(&self, delay: Duration) -> Result<CancelTimer, io::Error> {
        let released = Arc::new((Mutex::new(false), Condvar::new()));
        let local_released = Arc::clone(&released);
        let signal = self.clone();
        let thread = thread::Builder::new()
            .name("par_query cancel timer".to_string())
            .spawn(move || {
                let (lock, cvar) = &*local_released;
                let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                let (guard, wait) = cvar
                    .wait_timeout_while(guard, delay, |released| !*released)
                    .unwrap_or_else(PoisonError::into_inner);
                if wait.timed_out() && !*guard {
                    signal.cancel_with(CancelReason::TimedOut(delay));
                }
            })?;
        Ok(CancelTimer {
            thread: Some(thread),
            released,
        })
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Armed timeout for a [`CancellationSignal`]. Dropping it disarms the
/// timer and joins its thread.
pub struct CancelTimer {
    thread: Option<thread::JoinHandle<()>>,
    released: Arc<(Mutex<bool>, Condvar)>,
}

impl Drop for CancelTimer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let (lock, cvar) = &*self.released;
            *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
            cvar.notify_all();
            if thread.join().is_err() {
                debug!("cancel timer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};
    use super::{CancelReason, CancellationSignal};

    #[test]
    fn trigger_is_idempotent() {
        let signal = CancellationSignal::new();
        assert!(!signal.is_cancelled());
        assert_eq!(signal.reason(), None);

        assert!(signal.cancel());
        assert!(!signal.cancel_with(CancelReason::TimedOut(Duration::from_secs(1))));
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), Some(CancelReason::Requested));
    }

    #[test]
    fn clones_share_state() {
        let signal = CancellationSignal::new();
        let remote = signal.clone();
        thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn timer_fires() {
        let signal = CancellationSignal::new();
        let _timer = signal.cancel_after(Duration::from_millis(10)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !signal.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(signal.reason(), Some(CancelReason::TimedOut(Duration::from_millis(10))));
    }

    #[test]
    fn dropped_timer_never_fires() {
        let signal = CancellationSignal::new();
        let started = Instant::now();
        drop(signal.cancel_after(Duration::from_secs(60)).unwrap());
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(!signal.is_cancelled());
    }
}

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in memctx packages.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// How often [`wait_until()`] re-evaluates its condition.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Runs a test with a timeout to prevent infinite hangs.
///
/// If the test takes longer than the timeout to complete, the test fails instead of blocking
/// the test run forever. Lock-ordering mistakes between a manager, its contexts and the reaper
/// thread typically show up as exactly such hangs.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under Miri, where thread
/// synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled
/// and the test function is executed directly. This allows mutation testing to properly
/// detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {timeout:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Polls `condition` until it returns `true` or `timeout` elapses.
///
/// Returns whether the condition was observed to be true. Use this instead of a fixed sleep
/// when waiting for a background thread (such as the reaper) to act, so the test finishes as
/// soon as the effect is visible.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use testing::wait_until;
///
/// assert!(wait_until(Duration::from_secs(1), || true));
/// assert!(!wait_until(Duration::from_millis(10), || false));
/// ```
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now()
        .checked_add(timeout)
        .expect("timeout must not overflow the clock");

    loop {
        if condition() {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Counts how often pool callbacks are invoked.
///
/// Hand [`allocator()`][Self::allocator] and [`cleaner()`][Self::cleaner] to a pool and then
/// inspect [`allocated()`][Self::allocated] and [`cleaned()`][Self::cleaned] to verify that
/// objects were created and torn down as expected.
///
/// Clones share the same counters.
///
/// # Example
///
/// ```rust
/// use testing::CallbackCounter;
///
/// let counter = CallbackCounter::new();
///
/// let allocate = counter.allocator(|| vec![0_u8; 16]);
/// let clean = counter.cleaner::<Vec<u8>>();
///
/// clean(allocate());
///
/// assert_eq!(counter.allocated(), 1);
/// assert_eq!(counter.cleaned(), 1);
/// assert_eq!(counter.live(), 0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct CallbackCounter {
    allocated: Arc<AtomicUsize>,
    cleaned: Arc<AtomicUsize>,
}

impl CallbackCounter {
    /// Creates a counter with nothing recorded yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps `make` in an allocator callback that counts its invocations.
    pub fn allocator<T: 'static>(
        &self,
        make: impl Fn() -> T + Send + Sync + 'static,
    ) -> impl Fn() -> T + Send + Sync + 'static {
        let allocated = Arc::clone(&self.allocated);

        move || {
            allocated.fetch_add(1, Ordering::Relaxed);
            make()
        }
    }

    /// A cleaner callback that counts and drops the objects it receives.
    pub fn cleaner<T: 'static>(&self) -> impl Fn(T) + Send + Sync + 'static {
        let cleaned = Arc::clone(&self.cleaned);

        move |item: T| {
            cleaned.fetch_add(1, Ordering::Relaxed);
            drop(item);
        }
    }

    /// How many objects the allocator has created.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// How many objects the cleaner has torn down.
    #[must_use]
    pub fn cleaned(&self) -> usize {
        self.cleaned.load(Ordering::Relaxed)
    }

    /// How many allocated objects have not been cleaned yet.
    #[must_use]
    pub fn live(&self) -> usize {
        self.allocated().saturating_sub(self.cleaned())
    }
}

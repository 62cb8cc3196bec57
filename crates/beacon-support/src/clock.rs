use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant as StdInstant};

/// Injectable time source for the writer's backoff clock and the reactor's
/// timer/idle-reap clock. Both only ever need a monotonic instant and
/// durations between two such instants; nothing here claims cross-process
/// or cross-core comparability.
pub trait Clock: Send + Sync {
    fn now(&self) -> StdInstant;
}

/// Default clock, backed by `std::time::Instant`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> StdInstant {
        StdInstant::now()
    }
}

/// Test double that only advances when told to, so backoff/idle-reap
/// scenarios don't need real sleeps to exercise multi-second thresholds.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<StdInstant>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(StdInstant::now()) })
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.lock().unwrap();
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> StdInstant {
        *self.inner.lock().unwrap()
    }
}

use std::time::{Duration, Instant};

/// Handle for a registered timer, returned from [`crate::EventLoop::every`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) usize);

pub type TimerCallback = Box<dyn FnMut(TimerId) + Send>;

pub(crate) struct Timer {
    pub name: String,
    pub is_active: bool,
    pub period: Duration,
    pub due_time: Instant,
    pub callback: TimerCallback,
}

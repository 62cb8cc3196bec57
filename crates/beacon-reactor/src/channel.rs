use std::time::Instant;

use crate::socket::Socket;

/// Handle returned from registration, consumed by [`crate::EventLoop::socket_activate`]
/// and [`crate::EventLoop::socket_release`]. Opaque outside this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Source(pub(crate) usize);

/// Delivered through a channel's status callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    Writable,
    ConnClosed,
    ConnRefused,
    Dropped,
    Idle,
    Unknown,
}

pub type ReadCallback = Box<dyn FnMut(Source, &[u8]) + Send>;
pub type MonitorCallback = Box<dyn FnMut(Source) + Send>;
pub type StatusCallback = Box<dyn FnMut(Source, ChannelStatus, Option<i32>) + Send>;

/// The read/monitor/status closures a channel was registered with, bundled
/// as one capability object rather than threaded through as a raw opaque
/// pointer plus a family of function pointers.
#[derive(Default)]
pub struct Callbacks {
    pub read: Option<ReadCallback>,
    pub monitor: Option<MonitorCallback>,
    pub status: Option<StatusCallback>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Active,
    ShuttingDown,
    Removable,
}

/// One monitored file descriptor: its socket (`None` for stdin), callbacks,
/// and the bookkeeping the loop needs to schedule, deliver, and retire it.
pub(crate) struct Channel {
    pub name: String,
    pub socket: Option<Box<dyn Socket>>,
    pub fd: std::os::fd::RawFd,
    pub writable_interest: bool,
    pub callbacks: Callbacks,
    pub state: ChannelState,
    pub active: bool,
    /// `None` disables idle reaping for this channel.
    pub last_activity: Option<Instant>,
}

impl Channel {
    pub fn is_removable(&self) -> bool {
        self.state == ChannelState::Removable
    }
}

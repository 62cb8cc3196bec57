use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use beacon_support::{safe_assert, Clock, SystemClock};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::channel::{
    Callbacks, Channel, ChannelState, ChannelStatus, MonitorCallback, ReadCallback, Source,
    StatusCallback,
};
use crate::error::ReactorError;
use crate::socket::Socket;
use crate::timer::{Timer, TimerCallback, TimerId};

const DEFAULT_SCRATCH_LEN: usize = 10;
const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(60);
const READ_CHUNK: usize = 512;
const STDIN_FD: RawFd = 0;

/// Single-threaded reactor multiplexing fd readiness plus monotonic timers.
///
/// Channels and timers are held in slot arenas rather than an intrusive
/// linked list; [`Source`]/[`TimerId`] are indices into those arenas, not
/// shared references, matching the rest of this codebase's "index instead
/// of pointer" style for structures a single thread owns and mutates under
/// no lock.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    events_capacity: usize,
    channels: Vec<Option<Channel>>,
    free_channel_slots: Vec<usize>,
    timers: Vec<Option<Timer>>,
    free_timer_slots: Vec<usize>,
    clock: Arc<dyn Clock>,
    idle_threshold: Duration,
    running: bool,
    stop_reason: Option<i32>,
}

impl EventLoop {
    pub fn new() -> Result<Self, ReactorError> {
        Self::with_clock(SystemClock::new())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Result<Self, ReactorError> {
        Ok(Self {
            poll: Poll::new().map_err(ReactorError::PollSetup)?,
            events: Events::with_capacity(DEFAULT_SCRATCH_LEN),
            events_capacity: DEFAULT_SCRATCH_LEN,
            channels: Vec::new(),
            free_channel_slots: Vec::new(),
            timers: Vec::new(),
            free_timer_slots: Vec::new(),
            clock,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            running: false,
            stop_reason: None,
        })
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    /// Resets the loop to empty, as if freshly constructed. Deregisters
    /// every channel currently held; sockets themselves are dropped, not
    /// explicitly closed (ownership was always the caller's).
    pub fn init(&mut self) {
        for slot in self.channels.iter_mut() {
            if let Some(channel) = slot.take() {
                let _ = self.poll.registry().deregister(&mut SourceFd(&channel.fd));
            }
        }
        self.channels.clear();
        self.free_channel_slots.clear();
        self.timers.clear();
        self.free_timer_slots.clear();
        self.running = false;
        self.stop_reason = None;
    }

    pub fn on_read_channel(
        &mut self,
        socket: Box<dyn Socket>,
        read_cb: ReadCallback,
        status_cb: Option<StatusCallback>,
    ) -> io::Result<Source> {
        let fd = socket.fd();
        let name = socket.name().to_string();
        let now = self.clock.now();
        let channel = Channel {
            name,
            socket: Some(socket),
            fd,
            writable_interest: false,
            callbacks: Callbacks { read: Some(read_cb), monitor: None, status: status_cb },
            state: ChannelState::Active,
            active: true,
            last_activity: Some(now),
        };
        self.insert_channel(channel, Interest::READABLE)
    }

    pub fn on_monitor_channel(
        &mut self,
        socket: Box<dyn Socket>,
        monitor_cb: MonitorCallback,
        status_cb: Option<StatusCallback>,
    ) -> io::Result<Source> {
        let fd = socket.fd();
        let name = socket.name().to_string();
        let channel = Channel {
            name,
            socket: Some(socket),
            fd,
            writable_interest: false,
            callbacks: Callbacks { read: None, monitor: Some(monitor_cb), status: status_cb },
            state: ChannelState::Active,
            active: true,
            last_activity: None,
        };
        self.insert_channel(channel, Interest::READABLE)
    }

    /// Registers fd 0. Has no backing [`Socket`] — the `last_activity`
    /// tracking that idle-reaps connected channels never applies to stdin.
    pub fn on_stdin(&mut self, read_cb: ReadCallback) -> io::Result<Source> {
        self.on_raw_fd_read_channel("stdin", STDIN_FD, read_cb)
    }

    /// Registers an arbitrary fd with no backing [`Socket`], read the same
    /// way `on_stdin` reads fd 0 (plain `read`, not `recv`). `on_stdin` is
    /// this with the fd pinned to 0; exposed directly for fds that are
    /// stdin-shaped (pipes, eventfds) without literally being stdin.
    pub fn on_raw_fd_read_channel(
        &mut self,
        name: impl Into<String>,
        fd: RawFd,
        read_cb: ReadCallback,
    ) -> io::Result<Source> {
        let channel = Channel {
            name: name.into(),
            socket: None,
            fd,
            writable_interest: false,
            callbacks: Callbacks { read: Some(read_cb), monitor: None, status: None },
            state: ChannelState::Active,
            active: true,
            last_activity: None,
        };
        self.insert_channel(channel, Interest::READABLE)
    }

    pub fn on_out_channel(
        &mut self,
        socket: Box<dyn Socket>,
        status_cb: Option<StatusCallback>,
    ) -> io::Result<Source> {
        let fd = socket.fd();
        let name = socket.name().to_string();
        let channel = Channel {
            name,
            socket: Some(socket),
            fd,
            writable_interest: true,
            callbacks: Callbacks { read: None, monitor: None, status: status_cb },
            state: ChannelState::Active,
            active: true,
            last_activity: None,
        };
        self.insert_channel(channel, Interest::WRITABLE)
    }

    pub fn every(&mut self, name: impl Into<String>, period: Duration, cb: TimerCallback) -> TimerId {
        let timer = Timer {
            name: name.into(),
            is_active: true,
            period,
            due_time: self.clock.now() + period,
            callback: cb,
        };
        let idx = if let Some(i) = self.free_timer_slots.pop() {
            self.timers[i] = Some(timer);
            i
        } else {
            self.timers.push(Some(timer));
            self.timers.len() - 1
        };
        TimerId(idx)
    }

    /// Toggles a channel's active flag, (de)registering its fd with the
    /// poll instance accordingly.
    ///
    /// Registration failure on reactivation means the fd is no longer valid
    /// (closed or reused behind the channel's back) — this is the only point
    /// at which an invalid descriptor can actually be observed under epoll,
    /// since epoll_ctl validates the fd synchronously instead of surfacing a
    /// later readiness event for it. Treated as the `Dropped` status.
    pub fn socket_activate(&mut self, source: Source, flag: bool) {
        let Some((fd, interest, unchanged)) =
            self.channels.get(source.0).and_then(|c| c.as_ref()).map(|c| {
                let interest = if c.writable_interest { Interest::WRITABLE } else { Interest::READABLE };
                (c.fd, interest, c.active == flag)
            })
        else {
            return;
        };
        if unchanged {
            return;
        }
        if let Some(channel) = self.channels.get_mut(source.0).and_then(|c| c.as_mut()) {
            channel.active = flag;
        }
        if flag {
            if self.poll.registry().register(&mut SourceFd(&fd), Token(source.0), interest).is_err() {
                warn!(source = source.0, "failed to re-register channel on activate, fd no longer valid");
                if let Some(channel) = self.channels.get_mut(source.0).and_then(|c| c.as_mut()) {
                    channel.active = false;
                }
                self.deliver_status(source, ChannelStatus::Dropped, None);
            }
        } else if self.poll.registry().deregister(&mut SourceFd(&fd)).is_err() {
            debug!(source = source.0, "deregister on deactivate found nothing to remove");
        }
    }

    /// Deactivates and marks the channel removable. Retirement (fd
    /// deregistration, slot reuse) happens at the end of the current poll
    /// iteration, not synchronously here — a release called from inside a
    /// callback mid-iteration must not invalidate indices other callbacks in
    /// the same iteration still reference.
    pub fn socket_release(&mut self, source: Source) {
        let Some(channel) = self.channels.get_mut(source.0).and_then(|c| c.as_mut()) else {
            return;
        };
        channel.state = ChannelState::Removable;
        channel.active = false;
    }

    /// Initiates graceful teardown. Listening channels are released
    /// outright; connected sockets are half-closed and marked
    /// shutting-down so the loop keeps running until the peer's FIN (or a
    /// subsequent idle/error status) retires them.
    pub fn stop(&mut self, reason: i32) {
        let reason = if reason == 0 {
            warn!("stop() called with reason 0, coercing to 1");
            1
        } else {
            reason
        };
        self.running = false;
        self.stop_reason = Some(reason);

        for channel in self.channels.iter_mut().flatten() {
            match &channel.socket {
                Some(socket) if socket.is_listening() => {
                    channel.state = ChannelState::Removable;
                    channel.active = false;
                }
                Some(socket) => {
                    socket.shutdown();
                    channel.state = ChannelState::ShuttingDown;
                }
                None => {
                    channel.state = ChannelState::Removable;
                    channel.active = false;
                }
            }
        }
    }

    /// Runs until [`Self::stop`] has been called and every source has
    /// retired.
    pub fn run(&mut self) -> Result<i32, ReactorError> {
        if self.running {
            return Err(ReactorError::AlreadyRunning);
        }
        self.running = true;
        self.stop_reason = None;
        loop {
            self.run_once()?;
            let any_active = self
                .channels
                .iter()
                .flatten()
                .any(|c| c.active || c.state == ChannelState::ShuttingDown);
            if !self.running && !any_active {
                break;
            }
        }
        Ok(self.stop_reason.unwrap_or(0))
    }

    /// Count of channels still active or mid-graceful-shutdown, the same
    /// condition [`Self::run`] polls to decide whether it can return. Lets a
    /// caller drive the loop by hand with repeated [`Self::run_once`] calls
    /// (to interleave its own bookkeeping between iterations) while still
    /// knowing when every source has actually retired after [`Self::stop`].
    pub fn active_source_count(&self) -> usize {
        self.channels
            .iter()
            .flatten()
            .filter(|c| c.active || c.state == ChannelState::ShuttingDown)
            .count()
    }

    /// Runs a single iteration; exposed so tests can step the loop
    /// deterministically instead of spawning a thread for [`Self::run`].
    pub fn run_once(&mut self) -> Result<(), ReactorError> {
        let now = self.clock.now();
        let timeout = self.next_timeout(now);

        let has_active_fd = self.channels.iter().flatten().any(|c| c.active);
        let has_timer = self.timers.iter().flatten().any(|t| t.is_active);
        if !has_active_fd && !has_timer {
            return Ok(());
        }

        self.ensure_events_capacity();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(ReactorError::Io(e)),
        }

        let now = self.clock.now();
        let evs: Vec<(Source, bool, bool, bool, bool)> = self
            .events
            .iter()
            .map(|e| {
                (
                    Source(e.token().0),
                    e.is_readable(),
                    e.is_writable(),
                    e.is_error(),
                    e.is_read_closed() || e.is_write_closed(),
                )
            })
            .collect();

        for (source, readable, writable, errored, closed) in evs {
            let is_active = self
                .channels
                .get(source.0)
                .and_then(|c| c.as_ref())
                .map(|c| c.active)
                .unwrap_or(false);
            if !is_active {
                continue;
            }
            self.dispatch_event(source, readable, writable, errored, closed, now);
        }

        self.idle_sweep(self.clock.now());
        self.sweep_removable();
        self.fire_timers(self.clock.now());

        Ok(())
    }

    fn insert_channel(&mut self, channel: Channel, interest: Interest) -> io::Result<Source> {
        let idx = self.alloc_channel_slot();
        safe_assert!(self.channels[idx].is_none(), "reused channel slot must be vacant");
        self.poll.registry().register(&mut SourceFd(&channel.fd), Token(idx), interest)?;
        self.channels[idx] = Some(channel);
        Ok(Source(idx))
    }

    fn alloc_channel_slot(&mut self) -> usize {
        if let Some(idx) = self.free_channel_slots.pop() {
            idx
        } else {
            self.channels.push(None);
            self.channels.len() - 1
        }
    }

    fn ensure_events_capacity(&mut self) {
        let active_fds = self.channels.iter().flatten().filter(|c| c.active).count();
        if active_fds > self.events_capacity {
            let mut new_cap = self.events_capacity.max(DEFAULT_SCRATCH_LEN);
            while new_cap < active_fds {
                new_cap *= 2;
            }
            self.events = Events::with_capacity(new_cap);
            self.events_capacity = new_cap;
        }
    }

    /// Minimum of active timers' due times and active channels' idle
    /// deadlines, so a channel with no traffic still gets woken and swept
    /// for idleness even though it never appears in a readiness batch.
    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let timer_deadline = self
            .timers
            .iter()
            .flatten()
            .filter(|t| t.is_active)
            .map(|t| t.due_time.saturating_duration_since(now));
        let idle_deadline = self
            .channels
            .iter()
            .flatten()
            .filter(|c| c.active)
            .filter_map(|c| c.last_activity)
            .map(|t| (t + self.idle_threshold).saturating_duration_since(now));
        timer_deadline.chain(idle_deadline).min()
    }

    fn dispatch_event(
        &mut self,
        source: Source,
        readable: bool,
        writable: bool,
        errored: bool,
        closed: bool,
        now: Instant,
    ) {
        if errored {
            self.handle_error(source);
            return;
        }

        let mut had_new_data = false;

        if closed {
            self.deactivate(source);
            self.drain_remaining(source, now);
            self.deliver_status(source, ChannelStatus::ConnClosed, None);
        } else if readable {
            had_new_data = self.handle_readable(source, now);
        }

        if !closed && self.is_shutting_down(source) && !had_new_data {
            self.socket_release(source);
        }

        if writable {
            self.touch_activity(source, now);
            self.deliver_status(source, ChannelStatus::Writable, None);
        }
    }

    fn handle_error(&mut self, source: Source) {
        let fd = match self.channels.get(source.0).and_then(|c| c.as_ref()) {
            Some(channel) => channel.fd,
            None => return,
        };
        let mut buf = [0u8; 32];
        let mut errno = None;
        // The channel is deactivated right after this regardless, so there's
        // no reason to leave the bytes in the socket buffer for anyone else.
        // SAFETY: `buf` outlives the call and `fd` belongs to this channel.
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            errno = io::Error::last_os_error().raw_os_error();
        }
        let status = match errno {
            Some(e) if e == libc::ECONNREFUSED => ChannelStatus::ConnRefused,
            _ => ChannelStatus::Unknown,
        };
        self.deactivate(source);
        self.deliver_status(source, status, errno);
    }

    /// Returns whether at least one byte was delivered through the read
    /// callback (or the monitor callback fired) this call.
    fn handle_readable(&mut self, source: Source, now: Instant) -> bool {
        let (has_read_cb, fd, is_socket) = {
            let Some(channel) = self.channels.get(source.0).and_then(|c| c.as_ref()) else {
                return false;
            };
            (channel.callbacks.read.is_some(), channel.fd, channel.socket.is_some())
        };

        if !has_read_cb {
            let Some(channel) = self.channels.get_mut(source.0).and_then(|c| c.as_mut()) else {
                return false;
            };
            let Some(monitor) = channel.callbacks.monitor.as_mut() else {
                return false;
            };
            monitor(source);
            if channel.last_activity.is_some() {
                channel.last_activity = Some(now);
            }
            return true;
        }

        let mut buf = [0u8; READ_CHUNK];
        let mut delivered = false;
        loop {
            // SAFETY: `buf` is a valid READ_CHUNK-byte buffer for the syscall
            // duration; `fd` belongs to a still-registered channel.
            let n = unsafe {
                if is_socket {
                    libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0)
                } else {
                    libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
                }
            };

            if n > 0 {
                let n = n as usize;
                delivered = true;
                if let Some(channel) = self.channels.get_mut(source.0).and_then(|c| c.as_mut()) {
                    if channel.last_activity.is_some() {
                        channel.last_activity = Some(now);
                    }
                    if let Some(read_cb) = channel.callbacks.read.as_mut() {
                        read_cb(source, &buf[..n]);
                    }
                }
                continue;
            } else if n == 0 {
                if is_socket {
                    self.deactivate(source);
                    self.deliver_status(source, ChannelStatus::ConnClosed, None);
                }
                break;
            } else {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                } else if err.raw_os_error() == Some(libc::ENOTSOCK) {
                    self.socket_release(source);
                    break;
                } else {
                    warn!(?err, "channel read error");
                    break;
                }
            }
        }

        delivered
    }

    /// Drains whatever bytes the peer sent before the FIN, used on `HUP`
    /// before the final `CONN_CLOSED` delivery.
    fn drain_remaining(&mut self, source: Source, now: Instant) {
        let (has_read_cb, fd, is_socket) = {
            let Some(channel) = self.channels.get(source.0).and_then(|c| c.as_ref()) else {
                return;
            };
            (channel.callbacks.read.is_some(), channel.fd, channel.socket.is_some())
        };
        if !has_read_cb {
            return;
        }
        let mut buf = [0u8; READ_CHUNK];
        loop {
            // SAFETY: see `handle_readable`.
            let n = unsafe {
                if is_socket {
                    libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0)
                } else {
                    libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
                }
            };
            if n <= 0 {
                break;
            }
            let n = n as usize;
            if let Some(channel) = self.channels.get_mut(source.0).and_then(|c| c.as_mut()) {
                if channel.last_activity.is_some() {
                    channel.last_activity = Some(now);
                }
                if let Some(read_cb) = channel.callbacks.read.as_mut() {
                    read_cb(source, &buf[..n]);
                }
            }
        }
    }

    fn deactivate(&mut self, source: Source) {
        if let Some(channel) = self.channels.get_mut(source.0).and_then(|c| c.as_mut()) {
            channel.active = false;
        }
    }

    fn touch_activity(&mut self, source: Source, now: Instant) {
        if let Some(channel) = self.channels.get_mut(source.0).and_then(|c| c.as_mut()) {
            if channel.last_activity.is_some() {
                channel.last_activity = Some(now);
            }
        }
    }

    fn is_shutting_down(&self, source: Source) -> bool {
        self.channels
            .get(source.0)
            .and_then(|c| c.as_ref())
            .map(|c| c.state == ChannelState::ShuttingDown)
            .unwrap_or(false)
    }

    /// Scans every active channel for staleness, independent of whatever
    /// readiness events this iteration happened to carry — a channel with
    /// no traffic at all for the idle threshold never appears in a
    /// readiness batch, so idleness can't be detected by piggybacking on
    /// per-event dispatch alone.
    fn idle_sweep(&mut self, now: Instant) {
        let stale: Vec<usize> = self
            .channels
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let c = c.as_ref()?;
                if !c.active {
                    return None;
                }
                let last = c.last_activity?;
                (now.saturating_duration_since(last) > self.idle_threshold).then_some(i)
            })
            .collect();
        for idx in stale {
            let source = Source(idx);
            self.deliver_status(source, ChannelStatus::Idle, None);
            if let Some(channel) = self.channels.get_mut(idx).and_then(|c| c.as_mut()) {
                if channel.last_activity.is_some() {
                    channel.last_activity = Some(now);
                }
            }
        }
    }

    /// Applies the channel's status callback, or the spec's default
    /// handling if none was registered.
    fn deliver_status(&mut self, source: Source, status: ChannelStatus, errno: Option<i32>) {
        let has_cb = self
            .channels
            .get(source.0)
            .and_then(|c| c.as_ref())
            .map(|c| c.callbacks.status.is_some())
            .unwrap_or(false);

        if has_cb {
            if let Some(channel) = self.channels.get_mut(source.0).and_then(|c| c.as_mut()) {
                if let Some(cb) = channel.callbacks.status.as_mut() {
                    cb(source, status, errno);
                }
            }
            return;
        }

        match status {
            ChannelStatus::Writable => {}
            ChannelStatus::ConnClosed
            | ChannelStatus::ConnRefused
            | ChannelStatus::Dropped
            | ChannelStatus::Idle => {
                self.socket_release(source);
            }
            ChannelStatus::Unknown => {
                let name = self
                    .channels
                    .get(source.0)
                    .and_then(|c| c.as_ref())
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                warn!(channel = %name, "unhandled channel status with no status callback");
            }
        }
    }

    fn sweep_removable(&mut self) {
        let removable: Vec<usize> = self
            .channels
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().filter(|c| c.is_removable()).map(|_| i))
            .collect();
        for idx in removable {
            if let Some(channel) = self.channels[idx].take() {
                let _ = self.poll.registry().deregister(&mut SourceFd(&channel.fd));
            }
            self.free_channel_slots.push(idx);
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        for idx in 0..self.timers.len() {
            let due = matches!(self.timers[idx].as_ref(), Some(t) if t.is_active && t.due_time <= now);
            if !due {
                continue;
            }
            let mut ticks = 0u32;
            if let Some(timer) = self.timers[idx].as_mut() {
                while timer.due_time <= now {
                    timer.due_time += timer.period;
                    ticks += 1;
                    if ticks > 1_000_000 {
                        break;
                    }
                }
            }
            if ticks > 1 {
                if let Some(timer) = self.timers[idx].as_ref() {
                    debug!(timer = %timer.name, skipped = ticks - 1, "periodic timer skipped ticks");
                }
            }
            if let Some(timer) = self.timers[idx].as_mut() {
                (timer.callback)(TimerId(idx));
            }
        }
    }
}

static GLOBAL: OnceCell<Mutex<EventLoop>> = OnceCell::new();

/// Default-singleton accessor, kept for API parity with a process-wide
/// reactor. Tests should construct an owned [`EventLoop`] directly so each
/// gets an isolated instance instead of sharing process-global state.
pub fn global() -> &'static Mutex<EventLoop> {
    GLOBAL.get_or_init(|| Mutex::new(EventLoop::new().expect("failed to initialize global reactor")))
}

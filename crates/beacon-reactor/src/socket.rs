use std::cell::Cell;
use std::os::fd::{AsRawFd, RawFd};

/// Capability object the loop multiplexes over. The loop never owns a
/// socket's lifecycle — the registering caller does, and is responsible for
/// dropping it after the channel retires.
pub trait Socket: Send {
    fn fd(&self) -> RawFd;
    fn name(&self) -> &str;
    fn is_disconnected(&self) -> bool;
    fn is_listening(&self) -> bool;
    fn shutdown(&self);
}

enum Inner {
    Listener(mio::net::TcpListener),
    Stream(mio::net::TcpStream),
}

/// A [`Socket`] over a `mio` TCP listener or stream.
pub struct TcpSocket {
    inner: Inner,
    name: String,
    disconnected: Cell<bool>,
}

impl TcpSocket {
    pub fn listener(listener: mio::net::TcpListener, name: impl Into<String>) -> Self {
        Self { inner: Inner::Listener(listener), name: name.into(), disconnected: Cell::new(false) }
    }

    pub fn stream(stream: mio::net::TcpStream, name: impl Into<String>) -> Self {
        Self { inner: Inner::Stream(stream), name: name.into(), disconnected: Cell::new(false) }
    }

    pub fn mark_disconnected(&self) {
        self.disconnected.set(true);
    }

    pub fn as_listener(&mut self) -> Option<&mut mio::net::TcpListener> {
        match &mut self.inner {
            Inner::Listener(l) => Some(l),
            Inner::Stream(_) => None,
        }
    }

    pub fn as_stream(&mut self) -> Option<&mut mio::net::TcpStream> {
        match &mut self.inner {
            Inner::Stream(s) => Some(s),
            Inner::Listener(_) => None,
        }
    }
}

impl Socket for TcpSocket {
    fn fd(&self) -> RawFd {
        match &self.inner {
            Inner::Listener(l) => l.as_raw_fd(),
            Inner::Stream(s) => s.as_raw_fd(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.get()
    }

    fn is_listening(&self) -> bool {
        matches!(self.inner, Inner::Listener(_))
    }

    fn shutdown(&self) {
        if let Inner::Stream(s) = &self.inner {
            s.shutdown(std::net::Shutdown::Write).ok();
        }
        self.disconnected.set(true);
    }
}

/// A [`Socket`] over a raw fd the caller keeps owning somewhere else —
/// typically a listener a monitor callback needs to call `accept()` on
/// directly, where the real `mio` object lives inside the closure rather
/// than inside the channel. Registration only ever needs the fd number, so
/// this just remembers that and never touches the fd itself.
pub struct BorrowedSocket {
    fd: RawFd,
    name: String,
}

impl BorrowedSocket {
    pub fn new(fd: RawFd, name: impl Into<String>) -> Self {
        Self { fd, name: name.into() }
    }
}

impl Socket for BorrowedSocket {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_disconnected(&self) -> bool {
        false
    }

    fn is_listening(&self) -> bool {
        true
    }

    fn shutdown(&self) {}
}

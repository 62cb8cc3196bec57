use std::io;

/// Capability object the writer drains into. A non-positive return from
/// [`OutputSink::write`] is the universal "retry later" signal — the sink is
/// free to buffer or reconnect internally; the writer never inspects the
/// error beyond that.
///
/// `write` is called while the writer's mutex is held, so implementations
/// must never call back into the [`crate::BufferedWriter`] that owns them.
pub trait OutputSink: Send {
    /// Attempts to write `payload`, prefixed by the replayed `meta` header.
    /// Returns the number of `payload` bytes accepted (the header is
    /// considered atomic: either fully resent or the whole call fails).
    fn write(&mut self, payload: &[u8], meta: &[u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()>;

    /// Label used in logs (e.g. a host:port or file path).
    fn dest(&self) -> &str;
}

/// A sink over a plain TCP connection, reconnecting lazily on the next
/// write after any I/O error.
pub struct TcpSink {
    addr: String,
    stream: Option<std::net::TcpStream>,
}

impl TcpSink {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), stream: None }
    }

    fn ensure_connected(&mut self) -> io::Result<&mut std::net::TcpStream> {
        if self.stream.is_none() {
            let stream = std::net::TcpStream::connect(&self.addr)?;
            stream.set_nodelay(true).ok();
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("just connected"))
    }
}

impl OutputSink for TcpSink {
    fn write(&mut self, payload: &[u8], meta: &[u8]) -> io::Result<usize> {
        use std::io::Write;

        let stream = match self.ensure_connected() {
            Ok(stream) => stream,
            Err(e) => {
                self.stream = None;
                return Err(e);
            }
        };
        if !meta.is_empty() {
            if let Err(e) = stream.write_all(meta) {
                self.stream = None;
                return Err(e);
            }
        }
        match stream.write(payload) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.shutdown(std::net::Shutdown::Both).ok();
        }
        Ok(())
    }

    fn dest(&self) -> &str {
        &self.addr
    }
}

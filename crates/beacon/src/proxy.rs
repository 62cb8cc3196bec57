use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use beacon_reactor::{BorrowedSocket, ChannelStatus, EventLoop, Source, TcpSocket};
use beacon_writer::{BufferedWriter, TcpSink};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::BeaconError;

/// Accepts TCP clients on `listen` and forwards each client's bytes,
/// opaquely, into a per-client [`BufferedWriter`] fronting `downstream`.
///
/// Shutdown is driven by `shutdown` (set by a signal handler in `main`):
/// once observed, the reactor is told to `stop()` and the loop keeps
/// stepping until every channel has retired, then every still-open client
/// writer is closed. Nothing here sleeps or spins waiting for that to
/// happen — each iteration is one non-blocking `run_once` plus draining
/// whatever the monitor/status callbacks queued up during it.
pub fn run_serve(
    listen: SocketAddr,
    downstream: String,
    settings: Settings,
    shutdown: Arc<AtomicBool>,
) -> Result<(), BeaconError> {
    let mut reactor = EventLoop::new()?.with_idle_threshold(settings.idle_threshold);

    let listener = mio::net::TcpListener::bind(listen)?;
    let listener_fd = listener.as_raw_fd();
    info!(%listen, %downstream, "beacon serve listening");

    let pending_accepts: Arc<Mutex<Vec<(mio::net::TcpStream, SocketAddr)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let accepts_for_cb = pending_accepts.clone();
    reactor.on_monitor_channel(
        Box::new(BorrowedSocket::new(listener_fd, format!("listen:{listen}"))),
        Box::new(move |_src| loop {
            match listener.accept() {
                Ok((stream, addr)) => accepts_for_cb.lock().unwrap().push((stream, addr)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }),
        None,
    )?;

    let pending_releases: Arc<Mutex<Vec<Source>>> = Arc::new(Mutex::new(Vec::new()));
    let mut clients: Vec<Arc<BufferedWriter>> = Vec::new();
    let mut stopping = false;

    loop {
        reactor.run_once()?;

        for (stream, addr) in pending_accepts.lock().unwrap().drain(..) {
            stream.set_nodelay(true).ok();
            let writer =
                Arc::new(BufferedWriter::create(Box::new(TcpSink::new(downstream.clone())), settings.writer));
            clients.push(writer.clone());
            let writer_for_read = writer.clone();
            let releases = pending_releases.clone();
            let socket = TcpSocket::stream(stream, format!("client:{addr}"));
            let src = reactor.on_read_channel(
                Box::new(socket),
                Box::new(move |_src, bytes: &[u8]| {
                    writer_for_read.push(bytes);
                }),
                Some(Box::new(move |source, status, _errno| match status {
                    ChannelStatus::ConnClosed
                    | ChannelStatus::ConnRefused
                    | ChannelStatus::Dropped
                    | ChannelStatus::Idle => {
                        writer.close();
                        releases.lock().unwrap().push(source);
                    }
                    ChannelStatus::Writable | ChannelStatus::Unknown => {}
                })),
            )?;
            info!(%addr, source = ?src, "accepted client");
        }

        for source in pending_releases.lock().unwrap().drain(..) {
            reactor.socket_release(source);
        }

        if !stopping && shutdown.swap(false, Ordering::Relaxed) {
            info!("shutdown requested, draining clients");
            reactor.stop(1);
            stopping = true;
        }

        if stopping && reactor.active_source_count() == 0 {
            break;
        }
    }

    for writer in clients {
        writer.close();
    }

    Ok(())
}

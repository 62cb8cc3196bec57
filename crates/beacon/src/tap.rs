use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use beacon_writer::{BufferedWriter, TcpSink};
use tracing::info;

use crate::config::Settings;

/// Feeds a single [`BufferedWriter`] from stdin, piping whatever bytes
/// arrive straight to `downstream`. No reactor involved — `tap` is one
/// unmultiplexed stream, not a proxy, so there's nothing to poll over.
pub fn run_tap(downstream: String, settings: Settings, shutdown: Arc<AtomicBool>) -> io::Result<()> {
    let writer = BufferedWriter::create(Box::new(TcpSink::new(downstream.clone())), settings.writer);
    info!(%downstream, "beacon tap started, reading stdin");

    let mut stdin = io::stdin().lock();
    let mut buf = [0u8; 4096];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                writer.push(&buf[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    writer.close();
    Ok(())
}

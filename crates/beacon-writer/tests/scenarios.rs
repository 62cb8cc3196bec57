use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use beacon_support::ManualClock;
use beacon_writer::{BufferedWriter, OutputSink, WriterConfig};

#[derive(Default)]
struct SinkState {
    fail_remaining: usize,
    paused: bool,
    received: Vec<u8>,
    metas_seen: Vec<Vec<u8>>,
}

#[derive(Clone)]
struct TestSink {
    state: Arc<Mutex<SinkState>>,
}

impl TestSink {
    fn new() -> Self {
        Self { state: Arc::new(Mutex::new(SinkState::default())) }
    }
}

impl OutputSink for TestSink {
    fn write(&mut self, payload: &[u8], meta: &[u8]) -> io::Result<usize> {
        let mut s = self.state.lock().unwrap();
        if s.paused {
            return Ok(0);
        }
        if s.fail_remaining > 0 {
            s.fail_remaining -= 1;
            return Err(io::Error::other("injected failure"));
        }
        s.metas_seen.push(meta.to_vec());
        s.received.extend_from_slice(payload);
        Ok(payload.len())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn dest(&self) -> &str {
        "test-sink"
    }
}

fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    pred()
}

#[test]
fn backoff_then_recovery_delivers_bytes_exactly_once() {
    let sink = TestSink::new();
    sink.state.lock().unwrap().fail_remaining = 3;
    let clock = ManualClock::new();
    let writer = BufferedWriter::create_with_clock(
        Box::new(sink.clone()),
        WriterConfig::default(),
        clock.clone(),
    );

    assert!(writer.push(b"hello world"));

    // First attempt fails immediately (no prior failure, so no delay yet).
    assert!(wait_until(
        || sink.state.lock().unwrap().fail_remaining == 2,
        Duration::from_secs(2)
    ));
    clock.advance(Duration::from_secs(2));
    assert!(wait_until(
        || sink.state.lock().unwrap().fail_remaining == 1,
        Duration::from_secs(2)
    ));
    clock.advance(Duration::from_secs(3));
    assert!(wait_until(
        || sink.state.lock().unwrap().fail_remaining == 0,
        Duration::from_secs(2)
    ));
    clock.advance(Duration::from_secs(5));
    assert!(wait_until(
        || sink.state.lock().unwrap().received == b"hello world",
        Duration::from_secs(2)
    ));

    writer.close();
    assert_eq!(sink.state.lock().unwrap().received, b"hello world");
}

#[test]
fn drop_oldest_under_pressure_keeps_most_recent_bytes() {
    // Two 16-byte links, none spare: once both are full, further pushes
    // into the still-filling link repack over its own undrained content
    // rather than ever blocking the producer. The other link (already the
    // oldest undrained data) is left alone until the worker can drain it.
    let sink = TestSink::new();
    sink.state.lock().unwrap().paused = true;
    let writer = BufferedWriter::create(Box::new(sink.clone()), WriterConfig::new(32, 16));

    for i in 0..4u8 {
        let chunk = [i; 16];
        assert!(writer.push(&chunk));
    }

    {
        let mut s = sink.state.lock().unwrap();
        s.paused = false;
    }
    writer.close();

    let received = sink.state.lock().unwrap().received.clone();
    let expected: Vec<u8> = [0u8; 16].into_iter().chain([3u8; 16]).collect();
    assert_eq!(received, expected);
}

#[test]
fn partial_message_roll_preserves_record_boundaries() {
    let sink = TestSink::new();
    let writer = BufferedWriter::create(Box::new(sink.clone()), WriterConfig::new(64, 16));

    let first_msg = vec![1u8; 20];
    let second_msg = vec![2u8; 8];
    assert!(writer.push(&first_msg));
    assert!(writer.push(&second_msg));

    assert!(wait_until(
        || sink.state.lock().unwrap().received.len() == 28,
        Duration::from_secs(2)
    ));
    writer.close();

    let received = sink.state.lock().unwrap().received.clone();
    assert_eq!(&received[..20], first_msg.as_slice());
    assert_eq!(&received[20..], second_msg.as_slice());
}

#[test]
fn close_drains_everything_pushed_before_it() {
    let sink = TestSink::new();
    let writer = BufferedWriter::create(Box::new(sink.clone()), WriterConfig::default());

    for i in 0..50u32 {
        assert!(writer.push(&i.to_le_bytes()));
    }
    writer.close();

    let received = sink.state.lock().unwrap().received.clone();
    assert_eq!(received.len(), 50 * 4);
    let expected: Vec<u8> = (0..50u32).flat_map(|i| i.to_le_bytes()).collect();
    assert_eq!(received, expected);
}

#[test]
fn get_write_buf_round_trips_zero_copy() {
    let sink = TestSink::new();
    let writer = BufferedWriter::create(Box::new(sink.clone()), WriterConfig::default());

    {
        let mut buf = writer.get_write_buf(true).expect("writer active");
        buf.spare_capacity_mut()[..5].copy_from_slice(b"abcde");
        buf.advance(5);
        buf.commit();
        buf.unlock_buf();
    }

    assert!(wait_until(
        || sink.state.lock().unwrap().received == b"abcde",
        Duration::from_secs(2)
    ));
    writer.close();
}

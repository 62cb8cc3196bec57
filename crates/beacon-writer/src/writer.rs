use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use beacon_support::{safe_assert, Clock, SystemClock};
use tracing::{info, warn};

use crate::backoff::BackoffState;
use crate::chain::ChainLink;
use crate::sbb::SegmentedByteBuffer;
use crate::sink::OutputSink;

/// Default per-link size when the caller doesn't pick one.
pub const DEFAULT_CHUNK_BYTES: usize = 1024;

/// `capacity_bytes`/`chunk_bytes` tunables, applied at [`BufferedWriter::create`].
#[derive(Clone, Copy, Debug)]
pub struct WriterConfig {
    pub capacity_bytes: usize,
    pub chunk_bytes: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { capacity_bytes: 16 * DEFAULT_CHUNK_BYTES, chunk_bytes: DEFAULT_CHUNK_BYTES }
    }
}

impl WriterConfig {
    /// `chunk_bytes == 0` selects [`DEFAULT_CHUNK_BYTES`].
    pub fn new(capacity_bytes: usize, chunk_bytes: usize) -> Self {
        let chunk_bytes = if chunk_bytes == 0 { DEFAULT_CHUNK_BYTES } else { chunk_bytes };
        Self { capacity_bytes, chunk_bytes }
    }
}

struct Inner {
    arena: Vec<ChainLink>,
    first: usize,
    writer: usize,
    available: usize,
    chunk_bytes: usize,
    meta: SegmentedByteBuffer,
    backoff: BackoffState,
    active: bool,
    sink: Box<dyn OutputSink>,
}

struct Shared {
    state: Mutex<Inner>,
    cv: Condvar,
    clock: Arc<dyn Clock>,
}

/// Bounded, self-draining producer/consumer queue. Many producer threads may
/// call [`Self::push`]/[`Self::push_meta`]/[`Self::get_write_buf`]
/// concurrently; exactly one dedicated worker thread drains accepted bytes
/// to the output sink, retrying through failures with exponential backoff
/// and dropping the oldest buffered data rather than blocking producers when
/// the ring is full.
pub struct BufferedWriter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedWriter {
    pub fn create(sink: Box<dyn OutputSink>, config: WriterConfig) -> Self {
        Self::create_with_clock(sink, config, SystemClock::new())
    }

    pub fn create_with_clock(
        sink: Box<dyn OutputSink>,
        config: WriterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let chunk_bytes = config.chunk_bytes;
        let total_links = (config.capacity_bytes / chunk_bytes).max(2);
        safe_assert!(total_links >= 2, "a chain needs at least two links to roll");
        let first_link = ChainLink::new(chunk_bytes, 0);
        let inner = Inner {
            arena: vec![first_link],
            first: 0,
            writer: 0,
            available: total_links - 1,
            chunk_bytes,
            meta: SegmentedByteBuffer::new(256),
            backoff: BackoffState::new(),
            active: true,
            sink,
        };
        let shared = Arc::new(Shared { state: Mutex::new(inner), cv: Condvar::new(), clock });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("beacon-writer-drain".into())
            .spawn(move || drain_loop(&worker_shared))
            .expect("failed to spawn drain worker thread");
        Self { shared, worker: Mutex::new(Some(worker)) }
    }

    /// Appends `bytes` as one complete record, rolling to a new link first
    /// if the current one lacks room. Returns `false` if the writer is
    /// inactive or allocation failed.
    pub fn push(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        let mut inner = self.shared.state.lock().unwrap();
        if !inner.active {
            return false;
        }
        let mut cur = inner.writer;
        if inner.arena[cur].sbb.remaining() < bytes.len() {
            cur = roll(&mut inner, cur);
            inner.writer = cur;
        }
        if inner.arena[cur].sbb.remaining() < bytes.len() {
            let target = inner.arena[cur].sbb.write_offset() + bytes.len();
            inner.arena[cur].sbb.grow_to(target);
        }
        safe_assert!(
            inner.arena[cur].sbb.remaining() >= bytes.len(),
            "writer link should always have room after roll/grow"
        );
        let accepted = inner.arena[cur].sbb.append(bytes).is_ok();
        drop(inner);
        if accepted {
            self.shared.cv.notify_one();
        }
        accepted
    }

    /// Appends to the protocol-header buffer replayed with every sink
    /// write. Never wakes the drain worker by itself.
    pub fn push_meta(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        let mut inner = self.shared.state.lock().unwrap();
        if !inner.active {
            return false;
        }
        if inner.meta.remaining() < bytes.len() {
            let target = inner.meta.write_offset() + bytes.len();
            inner.meta.grow_to(target);
        }
        inner.meta.append(bytes).is_ok()
    }

    /// Zero-copy variant: returns a guard over the current writer link,
    /// rolling forward first if it has already reached its target size.
    /// The guard holds the writer's mutex for its whole lifetime; dropping
    /// it (or calling [`WriteBufGuard::unlock_buf`]) releases the lock and
    /// wakes the drain worker. Bytes written through the guard aren't
    /// eligible to be drained until [`WriteBufGuard::commit`] is called.
    pub fn get_write_buf(&self, _exclusive: bool) -> Option<WriteBufGuard<'_>> {
        let mut inner = self.shared.state.lock().unwrap();
        if !inner.active {
            return None;
        }
        let cur = inner.writer;
        if inner.arena[cur].sbb.write_offset() >= inner.arena[cur].target_size {
            let new_idx = roll(&mut inner, cur);
            inner.writer = new_idx;
        }
        let link = inner.writer;
        Some(WriteBufGuard { shared: &self.shared, inner: Some(inner), link })
    }

    /// Marks the writer inactive, wakes and joins the drain worker (which
    /// finishes draining everything already accepted first), then closes
    /// the sink.
    pub fn close(&self) {
        {
            let mut inner = self.shared.state.lock().unwrap();
            if !inner.active {
                return;
            }
            inner.active = false;
        }
        self.shared.cv.notify_one();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::error!("beacon-writer drain worker panicked during shutdown");
            }
        }
        let mut inner = self.shared.state.lock().unwrap();
        if let Err(e) = inner.sink.close() {
            warn!(error = %e, dest = inner.sink.dest(), "error closing output sink");
        }
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Live handle into the writer link currently being filled, returned by
/// [`BufferedWriter::get_write_buf`].
pub struct WriteBufGuard<'a> {
    shared: &'a Shared,
    inner: Option<MutexGuard<'a, Inner>>,
    link: usize,
}

impl WriteBufGuard<'_> {
    pub fn spare_capacity_mut(&mut self) -> &mut [u8] {
        self.inner.as_mut().unwrap().arena[self.link].sbb.spare_capacity_mut()
    }

    pub fn advance(&mut self, n: usize) {
        self.inner.as_mut().unwrap().arena[self.link].sbb.advance_write(n);
    }

    /// Marks everything written through this guard so far as one complete,
    /// sendable record.
    pub fn commit(&mut self) {
        self.inner.as_mut().unwrap().arena[self.link].sbb.commit();
    }

    pub fn unlock_buf(self) {
        // Drop does the work; this just gives the spec'd call a name.
    }

    fn finish(&mut self) {
        if let Some(inner) = self.inner.take() {
            drop(inner);
            self.shared.cv.notify_one();
        }
    }
}

impl Drop for WriteBufGuard<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Chooses the next writer link when the current one can't accept the next
/// record. Returns the target link's index. If `current` held an
/// uncommitted tail past its `message` cursor, those bytes are carried over
/// so a record is never split across a roll.
fn roll(inner: &mut Inner, current: usize) -> usize {
    let next = inner.arena[current].next;
    let target = if inner.arena[next].sbb.is_empty() {
        inner.arena[next].sbb.clear();
        next
    } else if inner.available > 0 {
        let new_link = ChainLink::new(inner.chunk_bytes, next);
        inner.arena.push(new_link);
        let new_idx = inner.arena.len() - 1;
        inner.arena[current].next = new_idx;
        inner.available -= 1;
        new_idx
    } else {
        let fill = inner.arena[current].sbb.fill_len();
        if fill > 0 {
            warn!(dropped_bytes = fill, "buffered writer ring saturated, dropping oldest buffered data");
        }
        inner.arena[current].sbb.repack_message();
        return current;
    };

    let pending = inner.arena[current].sbb.pending_write_len();
    if pending > 0 {
        let tail = inner.arena[current].sbb.pending_write_slice().to_vec();
        if inner.arena[target].sbb.remaining() < tail.len() {
            let new_cap = inner.arena[target].sbb.write_offset() + tail.len();
            inner.arena[target].sbb.grow_to(new_cap);
        }
        inner.arena[target]
            .sbb
            .spare_capacity_mut()[..tail.len()]
            .copy_from_slice(&tail);
        inner.arena[target].sbb.advance_write(tail.len());
        inner.arena[current].sbb.reset_write_to_message();
    }
    target
}

fn drain_loop(shared: &Arc<Shared>) {
    loop {
        let mut inner = shared.state.lock().unwrap();
        if !inner.active {
            break;
        }
        // Skip the wait if a push already landed since our last scan — the
        // condvar doesn't queue notifications, so waiting unconditionally
        // here would miss a signal delivered between our last unlock and
        // this lock and stall until some later, unrelated push arrives.
        // When something is pending but backing off, poll it on a short
        // timeout instead of waiting forever for a push that may never
        // come, and instead of busy-spinning on the backoff check.
        inner = if has_pending(&inner) {
            shared.cv.wait_timeout(inner, Duration::from_millis(50)).unwrap().0
        } else {
            shared.cv.wait(inner).unwrap()
        };
        scan_and_drain(&mut inner, &shared.clock);
    }

    // Shutdown: keep sweeping until every link the producers managed to
    // push before close() is fully sent, per the close-drains invariant.
    loop {
        let mut inner = shared.state.lock().unwrap();
        let pending = scan_and_drain(&mut inner, &shared.clock);
        drop(inner);
        if !pending {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn has_pending(inner: &Inner) -> bool {
    let mut idx = inner.first;
    loop {
        if inner.arena[idx].sbb.pending_message_len() > 0 {
            return true;
        }
        if idx == inner.writer {
            return false;
        }
        idx = inner.arena[idx].next;
    }
}

/// Walks `first..=writer`, draining every link with unsent message bytes.
/// Returns whether any link still has pending bytes afterward.
fn scan_and_drain(inner: &mut Inner, clock: &Arc<dyn Clock>) -> bool {
    let mut idx = inner.first;
    let writer = inner.writer;
    let mut any_pending = false;
    loop {
        if inner.arena[idx].sbb.pending_message_len() > 0 {
            inner.arena[idx].reading = true;
            let done = process_link(inner, idx, clock);
            inner.arena[idx].reading = false;
            if !done {
                any_pending = true;
            }
        }
        if idx == writer {
            break;
        }
        idx = inner.arena[idx].next;
    }
    any_pending
}

/// Drives one link to the sink, honoring backoff. Returns `true` iff the
/// link is now fully sent (`read == write`, no uncommitted tail pending).
fn process_link(inner: &mut Inner, idx: usize, clock: &Arc<dyn Clock>) -> bool {
    let now = clock.now();
    if inner.backoff.should_delay(now) {
        return false;
    }

    let mut sent = 0usize;
    let mut size = inner.arena[idx].sbb.pending_message_len();
    let dest = inner.sink.dest().to_string();

    while sent < size {
        let meta = inner.meta.message_slice().to_vec();
        let payload = inner.arena[idx].sbb.message_slice()[sent..size].to_vec();
        match inner.sink.write(&payload, &meta) {
            Ok(n) if n > 0 => {
                if inner.backoff.record_success() {
                    info!(dest = %dest, "beacon-writer sink connected");
                }
                sent += n;
            }
            _ => {
                inner.arena[idx].sbb.reset_read();
                size = inner.arena[idx].sbb.pending_message_len();
                sent = 0;
                let backoff_secs = inner.backoff.record_failure(now);
                warn!(dest = %dest, backoff_secs, "beacon-writer sink write failed, backing off");
                return false;
            }
        }
    }

    inner.arena[idx].sbb.advance_read(sent);
    if inner.arena[idx].sbb.is_empty() {
        inner.arena[idx].sbb.clear();
        true
    } else {
        false
    }
}

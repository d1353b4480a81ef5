//! Per-(CPU, frame-type) lock-free single-producer/single-consumer byte ring
//! (C1, spec §3, §4.1).
//!
//! Grounded on `cognitod/src/runtime/sequencer.rs`'s `SequencerConsumer`:
//! same release/acquire discipline on a published cursor, the same
//! "producer never reads behind the consumer" invariant, generalized from a
//! fixed-slot ticket ring (a kernel eBPF producer writes it) to a plain byte
//! ring with one producer and one consumer, both userspace threads.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::frame::FrameType;
use crate::sem::Semaphore;

/// Returned by `begin_frame`; passed back to `end_frame` so an aborted frame
/// can rewind `write_pos` to exactly where it started.
#[derive(Debug, Clone, Copy)]
pub struct FrameToken {
    start: u64,
}

/// Hands the committed byte range to whoever drains the ring (normally the
/// Sender). Kept separate from `crate::sender::Sender` so ring buffers can be
/// unit-tested with a trivial in-memory sink.
pub trait RingSink {
    fn write_parts(&self, parts: &[&[u8]]) -> std::io::Result<usize>;
}

pub struct RingBuffer {
    core: i32,
    frame_type: FrameType,
    buf: UnsafeCell<Box<[u8]>>,
    mask: u64,
    size: u64,
    one_shot: bool,

    write_pos: AtomicU64,
    commit_pos: AtomicU64,
    read_pos: AtomicU64,

    reader_sem: Arc<Semaphore>,
    writer_sem: Semaphore,
    done: AtomicBool,
    last_commit_ns: AtomicU64,

    // Delta-encoding cache for event_header/event_core/event_tid. Touched
    // only by the producer thread, but needs `&self` access, hence the cell.
    last_event: UnsafeCell<(i64, i32, i32)>,
}

// SAFETY: `buf` is written only by the producer thread in the range
// [write_pos, write_pos+n) which by construction never overlaps the
// consumer's read range [read_pos, commit_pos) (enforced by wait_for_space
// checking free space against read_pos before any write). `last_event` is
// touched only by the producer. The three position counters are the only
// cross-thread-shared state and are atomics.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// `size` must be a power of two (enforced by the caller via CLI/config
    /// validation — spec §8 boundary behavior: non-power-of-two is rejected
    /// before a ring is ever constructed).
    pub fn new(
        core: i32,
        frame_type: FrameType,
        size: usize,
        one_shot: bool,
        reader_sem: Arc<Semaphore>,
    ) -> Self {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        RingBuffer {
            core,
            frame_type,
            buf: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
            mask: (size - 1) as u64,
            size: size as u64,
            one_shot,
            write_pos: AtomicU64::new(0),
            commit_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            reader_sem,
            writer_sem: Semaphore::new(0),
            done: AtomicBool::new(false),
            last_commit_ns: AtomicU64::new(0),
            last_event: UnsafeCell::new((-1, i32::MIN, i32::MIN)),
        }
    }

    pub fn core(&self) -> i32 {
        self.core
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Committed, unread bytes waiting for the consumer.
    pub fn bytes_available(&self) -> usize {
        let commit = self.commit_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        (commit - read) as usize
    }

    /// Total room left for the producer before it would overwrite unread
    /// bytes.
    fn free_space(&self) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        self.size as usize - (write - read) as usize
    }

    /// Room left before the buffer's physical wrap point, capped by
    /// `free_space`. Relevant to producers doing a single contiguous memcpy
    /// (e.g. copying a span straight out of a kernel mmap ring).
    pub fn contiguous_space_available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let to_wrap = (self.size - (write & self.mask)) as usize;
        self.free_space().min(to_wrap)
    }

    pub fn begin_frame(&self) -> FrameToken {
        FrameToken {
            start: self.write_pos.load(Ordering::Relaxed),
        }
    }

    /// If `abort`, rewinds `write_pos` back to the token, leaving no trace
    /// (spec §8 invariant 6).
    pub fn end_frame(&self, _now_ns: i64, abort: bool, token: FrameToken) {
        if abort {
            self.write_pos.store(token.start, Ordering::Relaxed);
        }
    }

    fn raw_write(&self, bytes: &[u8]) {
        debug_assert!(bytes.len() as u64 <= self.free_space() as u64);
        let buf = unsafe { &mut *self.buf.get() };
        let start = self.write_pos.load(Ordering::Relaxed) & self.mask;
        let len = bytes.len() as u64;
        let first_len = (self.size - start).min(len);
        buf[start as usize..(start + first_len) as usize]
            .copy_from_slice(&bytes[..first_len as usize]);
        if first_len < len {
            let rest = (len - first_len) as usize;
            buf[..rest].copy_from_slice(&bytes[first_len as usize..]);
        }
        self.write_pos.fetch_add(len, Ordering::Relaxed);
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        self.raw_write(bytes);
    }

    pub fn pack_int(&self, value: i32) {
        let mut tmp = Vec::with_capacity(5);
        crate::varint::write_i32(&mut tmp, value);
        self.raw_write(&tmp);
    }

    pub fn pack_int64(&self, value: i64) {
        let mut tmp = Vec::with_capacity(10);
        crate::varint::write_i64(&mut tmp, value);
        self.raw_write(&tmp);
    }

    pub fn write_string(&self, s: &str) {
        let mut tmp = Vec::with_capacity(s.len() + 5);
        crate::varint::write_string(&mut tmp, s);
        self.raw_write(&tmp);
    }

    /// Emits a timestamp only if it differs from the last one committed on
    /// this ring (delta-encoding, spec §3 "cached last event").
    pub fn event_header(&self, now_ns: i64) {
        let last = unsafe { &mut *self.last_event.get() };
        if last.0 != now_ns {
            self.pack_int64(now_ns);
            last.0 = now_ns;
        }
    }

    pub fn event_core(&self, core: i32) {
        let last = unsafe { &mut *self.last_event.get() };
        if last.1 != core {
            self.pack_int(core);
            last.1 = core;
        }
    }

    pub fn event_tid(&self, tid: i32) {
        let last = unsafe { &mut *self.last_event.get() };
        if last.2 != tid {
            self.pack_int(tid);
            last.2 = tid;
        }
    }

    /// Publishes `write_pos` into `commit_pos` and wakes the consumer,
    /// unless elided: `force == false` and fewer than half the ring is
    /// pending and under 100ms have passed since the previous commit.
    pub fn commit(&self, now_ns: i64, force: bool) {
        let write = self.write_pos.load(Ordering::Relaxed);
        let commit = self.commit_pos.load(Ordering::Relaxed);
        let pending = write - commit;
        if !force {
            let last = self.last_commit_ns.load(Ordering::Relaxed);
            if pending < self.size / 2 && (now_ns - last) < 100_000_000 {
                return;
            }
        }
        self.commit_pos.store(write, Ordering::Release);
        self.last_commit_ns.store(now_ns, Ordering::Relaxed);
        self.reader_sem.post();
    }

    /// Blocks the producer until at least `bytes` are free. In one-shot mode,
    /// a request larger than the ring can ever satisfy marks the ring done
    /// instead of blocking forever; in continuous mode such a request simply
    /// blocks (matching the source's documented, if dubious, behavior —
    /// spec §4.1 "Failure").
    pub fn wait_for_space(&self, bytes: usize) {
        if bytes as u64 > self.size && self.one_shot {
            self.set_done();
            return;
        }
        while self.free_space() < bytes {
            self.writer_sem.wait();
        }
    }

    pub fn set_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Reader-side drain: hands the committed segment to `sink` as one or
    /// two spans (depending on wraparound), advances `read_pos`, and wakes
    /// any producer parked in `wait_for_space`.
    pub fn write<S: RingSink>(&self, sink: &S) -> std::io::Result<usize> {
        let commit = self.commit_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Relaxed);
        if commit == read {
            return Ok(0);
        }
        let buf = unsafe { &*self.buf.get() };
        let start = (read & self.mask) as usize;
        let len = (commit - read) as usize;
        let end = start + len;
        let n = if end <= buf.len() {
            sink.write_parts(&[&buf[start..end]])?
        } else {
            let wrap_at = buf.len() - start;
            let (first, second) = (&buf[start..], &buf[..end - buf.len()]);
            debug_assert_eq!(first.len(), wrap_at);
            sink.write_parts(&[first, second])?
        };
        self.read_pos.store(commit, Ordering::Release);
        self.writer_sem.post();
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink(Mutex<Vec<u8>>);
    impl RingSink for CollectingSink {
        fn write_parts(&self, parts: &[&[u8]]) -> std::io::Result<usize> {
            let mut out = self.0.lock().unwrap();
            let mut n = 0;
            for p in parts {
                out.extend_from_slice(p);
                n += p.len();
            }
            Ok(n)
        }
    }

    fn ring(size: usize, one_shot: bool) -> RingBuffer {
        RingBuffer::new(0, FrameType::External, size, one_shot, Arc::new(Semaphore::new(0)))
    }

    #[test]
    fn invariant_read_le_commit_le_write() {
        let r = ring(64, false);
        let tok = r.begin_frame();
        r.write_bytes(b"hello");
        r.end_frame(0, false, tok);
        r.commit(0, true);
        assert!(r.read_pos.load(Ordering::Relaxed) <= r.commit_pos.load(Ordering::Relaxed));
        assert!(r.commit_pos.load(Ordering::Relaxed) <= r.write_pos.load(Ordering::Relaxed));
    }

    #[test]
    fn abort_rewinds_write_pos() {
        let r = ring(64, false);
        let before = r.write_pos.load(Ordering::Relaxed);
        let tok = r.begin_frame();
        r.write_bytes(b"some junk that should vanish");
        r.end_frame(0, true, tok);
        assert_eq!(r.write_pos.load(Ordering::Relaxed), before);
    }

    #[test]
    fn write_drains_committed_bytes_and_advances_read_pos() {
        let r = ring(64, false);
        let tok = r.begin_frame();
        r.write_bytes(b"payload");
        r.end_frame(0, false, tok);
        r.commit(0, true);
        let sink = CollectingSink(Mutex::new(Vec::new()));
        let n = r.write(&sink).unwrap();
        assert_eq!(n, 7);
        assert_eq!(&sink.0.lock().unwrap()[..], b"payload");
        assert_eq!(r.bytes_available(), 0);
    }

    #[test]
    fn write_handles_wraparound_as_two_spans() {
        let r = ring(16, false);
        // Push enough data through to force the write cursor near the wrap
        // point, then commit+drain a chunk that straddles it.
        let sink = CollectingSink(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let tok = r.begin_frame();
            r.write_bytes(b"1234567");
            r.end_frame(0, false, tok);
            r.commit(0, true);
            r.write(&sink).unwrap();
        }
        let tok = r.begin_frame();
        r.write_bytes(b"abcdefgh");
        r.end_frame(0, false, tok);
        r.commit(0, true);
        r.write(&sink).unwrap();
        let collected = sink.0.lock().unwrap();
        assert!(collected.ends_with(b"abcdefgh"));
    }

    #[test]
    fn commit_elided_below_watermark_and_within_window() {
        let r = ring(1024, false);
        let tok = r.begin_frame();
        r.write_bytes(b"tiny");
        r.end_frame(0, false, tok);
        r.commit(1_000_000, false); // 1ms, well under 100ms, well under half
        assert_eq!(r.commit_pos.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn commit_not_elided_when_forced() {
        let r = ring(1024, false);
        let tok = r.begin_frame();
        r.write_bytes(b"tiny");
        r.end_frame(0, false, tok);
        r.commit(1_000_000, true);
        assert_eq!(r.commit_pos.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn one_shot_sets_done_when_request_exceeds_capacity() {
        let r = ring(16, true);
        r.wait_for_space(64);
        assert!(r.is_done());
    }

    #[test]
    fn event_header_elides_unchanged_timestamp() {
        let r = ring(64, false);
        r.event_header(100);
        let after_first = r.write_pos.load(Ordering::Relaxed);
        r.event_header(100);
        assert_eq!(r.write_pos.load(Ordering::Relaxed), after_first);
        r.event_header(101);
        assert!(r.write_pos.load(Ordering::Relaxed) > after_first);
    }

    #[test]
    fn free_space_accounts_for_unread_backlog() {
        let r = ring(32, false);
        let before = r.contiguous_space_available();
        let tok = r.begin_frame();
        r.write_bytes(&[0u8; 10]);
        r.end_frame(0, false, tok);
        assert_eq!(r.contiguous_space_available(), before - 10);
    }
}

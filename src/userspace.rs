//! User-Space Source (C7), spec §4.7.
//!
//! A single thread that polls software counters at a fixed 100ms cadence,
//! ignoring the session's sample rate entirely (unlike every other
//! source). Grounded on the same Monitor-less "sleep and tick" shape
//! `cognitod`'s periodic background tasks use (e.g. its tag-cache save
//! loop in `main.rs`), translated from a tokio interval to
//! `std::thread::sleep` since this source has no fd to wait on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::FrameType;
use crate::ring::RingBuffer;
use crate::sem::Semaphore;
use crate::session::Session;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A software counter exposed by a driver (e.g. a `/sys` read). Real driver
/// implementations are external collaborators; this trait is the interface
/// the source needs (spec §4.7: "invoking `read(buffer)` on each enabled
/// polled driver").
pub trait PolledDriver: Send + Sync {
    /// Returns `(key, value)` pairs for every enabled counter this driver
    /// owns.
    fn read(&self) -> Vec<(u32, i64)>;
}

/// Reads a single integer from a `/sys` file, the common shape for Linux
/// software counters (spec §4.7 "e.g. /sys reads").
pub struct SysfsCounterDriver {
    entries: Vec<(u32, std::path::PathBuf)>,
}

impl SysfsCounterDriver {
    pub fn new(entries: Vec<(u32, std::path::PathBuf)>) -> Self {
        SysfsCounterDriver { entries }
    }
}

impl PolledDriver for SysfsCounterDriver {
    fn read(&self) -> Vec<(u32, i64)> {
        self.entries
            .iter()
            .filter_map(|(key, path)| {
                std::fs::read_to_string(path)
                    .ok()
                    .and_then(|s| s.trim().parse::<i64>().ok())
                    .map(|v| (*key, v))
            })
            .collect()
    }
}

pub struct UserSpaceSource {
    ring: Arc<RingBuffer>,
    drivers: Vec<Box<dyn PolledDriver>>,
    interrupted: AtomicBool,
    session: Arc<Session>,
}

impl UserSpaceSource {
    pub fn new(
        session: Arc<Session>,
        reader_sem: Arc<Semaphore>,
        drivers: Vec<Box<dyn PolledDriver>>,
    ) -> Self {
        let ring = Arc::new(RingBuffer::new(
            -1,
            FrameType::BlockCounter,
            1 << 16,
            session.one_shot,
            reader_sem,
        ));
        UserSpaceSource {
            ring,
            drivers,
            interrupted: AtomicBool::new(false),
            session,
        }
    }

    pub fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    pub fn start(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("gatord-userspace".into())
            .spawn(move || self.run())
            .expect("spawn user-space source thread")
    }

    fn run(self: Arc<Self>) {
        crate::set_thread_name("gatord-userspace");
        while !self.session.has_started() && !self.interrupted.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(5));
        }
        while !self.interrupted.load(Ordering::Acquire) {
            self.tick(crate::monotonic_now_ns());
            std::thread::sleep(POLL_INTERVAL);
        }
        self.ring.set_done();
    }

    /// One sampling tick: `eventHeader(now)` followed by per-driver
    /// `event64(key, value)` entries, then a commit (spec §4.7).
    fn tick(&self, now_ns: i64) {
        let readings: Vec<(u32, i64)> = self.drivers.iter().flat_map(|d| d.read()).collect();
        if readings.is_empty() {
            return;
        }
        self.ring.wait_for_space(readings.len() * 24 + 16);
        let tok = self.ring.begin_frame();
        self.ring.event_header(now_ns);
        for (key, value) in readings {
            self.ring.pack_int(key as i32);
            self.ring.pack_int64(value);
        }
        self.ring.end_frame(now_ns, false, tok);
        self.ring.commit(now_ns, false);
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.ring.is_done()
    }

    pub fn write<S: crate::ring::RingSink>(&self, sink: &S) -> std::io::Result<usize> {
        self.ring.write(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDriver(Vec<(u32, i64)>);
    impl PolledDriver for FixedDriver {
        fn read(&self) -> Vec<(u32, i64)> {
            self.0.clone()
        }
    }

    fn started_session() -> Arc<Session> {
        let session = Session::new();
        session.mark_started(1);
        Arc::new(session)
    }

    #[test]
    fn tick_packs_nothing_when_no_readings() {
        let source = UserSpaceSource::new(started_session(), Arc::new(Semaphore::new(0)), vec![]);
        source.tick(100);
        assert_eq!(source.ring.bytes_available(), 0);
    }

    #[test]
    fn tick_packs_header_and_entries_when_driver_has_readings() {
        let source = UserSpaceSource::new(
            started_session(),
            Arc::new(Semaphore::new(0)),
            vec![Box::new(FixedDriver(vec![(1, 42), (2, -7)]))],
        );
        source.tick(100);
        assert!(source.ring.bytes_available() > 0);
    }

    #[test]
    fn sysfs_driver_skips_unreadable_entries() {
        let driver = SysfsCounterDriver::new(vec![(1, std::path::PathBuf::from("/nonexistent"))]);
        assert!(driver.read().is_empty());
    }

    #[test]
    fn interrupt_sets_done_after_run_observes_it() {
        let source = Arc::new(UserSpaceSource::new(
            started_session(),
            Arc::new(Semaphore::new(0)),
            vec![],
        ));
        source.interrupted.store(true, Ordering::Release);
        assert!(source.interrupted.load(Ordering::Acquire));
    }
}

//! GPU HW Counter Source (C8), spec §4.8.
//!
//! Periodically samples Mali GPU hardware counters via a vendor device fd.
//! The Midgard/Mali wire dialect itself is out of scope (spec §1); this
//! module models the block/counter layout walk and the averaging/summing
//! rules behind a small `GpuDevice` trait so the source logic is testable
//! without a real Mali driver. Grounded on `perf::detect`'s "enumerate a
//! table, resolve entries against a user selection" shape, applied to
//! per-block GPU counters instead of per-CPU PMUs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::frame::FrameType;
use crate::ring::RingBuffer;
use crate::sem::Semaphore;
use crate::session::{SampleRate, Session};

/// How a block's per-core counter values are combined into one wire value
/// (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Shader-core counters are averaged across cores.
    ShaderCore,
    /// MMU/L2 counters are summed across blocks.
    MmuL2,
    /// Everything else is passed through unmodified.
    PassThrough,
}

#[derive(Debug, Clone)]
pub struct BlockLayout {
    pub block_index: u32,
    pub kind: BlockKind,
    pub counter_names: Vec<String>,
}

/// One raw per-core/per-block reading before combination.
#[derive(Debug, Clone, Copy)]
pub struct RawCounterValue {
    pub block_index: u32,
    pub counter_index: u32,
    pub core_index: u32,
    pub value: u64,
}

/// The vendor device interface: everything Mali-protocol-specific lives
/// behind this trait (spec §1 "Mali vendor protocol dialects ... specified
/// only where they feed the ring buffer").
pub trait GpuDevice: Send + Sync {
    fn block_layout(&self) -> Vec<BlockLayout>;
    /// Blocks until a new sample buffer is ready and returns its raw
    /// values.
    fn wait_for_sample(&self) -> std::io::Result<Vec<RawCounterValue>>;
}

/// Combines raw per-core/per-block values per spec §4.8's averaging/summing
/// rules, resolving each against `layout` and the caller's counter
/// selection (`selected`: counter names the user enabled).
pub fn combine_samples(
    layout: &[BlockLayout],
    raw: &[RawCounterValue],
    selected: &std::collections::HashSet<String>,
) -> Vec<(String, u32, u64)> {
    let mut grouped: std::collections::BTreeMap<(u32, u32), Vec<u64>> =
        std::collections::BTreeMap::new();
    for r in raw {
        grouped
            .entry((r.block_index, r.counter_index))
            .or_default()
            .push(r.value);
    }

    let mut out = Vec::new();
    for block in layout {
        for (counter_index, name) in block.counter_names.iter().enumerate() {
            if !selected.is_empty() && !selected.contains(name) {
                continue;
            }
            let Some(values) = grouped.get(&(block.block_index, counter_index as u32)) else {
                continue;
            };
            let combined = match block.kind {
                BlockKind::ShaderCore => {
                    values.iter().sum::<u64>() / values.len().max(1) as u64
                }
                BlockKind::MmuL2 => values.iter().sum(),
                BlockKind::PassThrough => values.first().copied().unwrap_or(0),
            };
            out.push((name.clone(), block.block_index, combined));
        }
    }
    out
}

/// Filmstrip "only one at a time" enforcement (spec.md Open Questions #2;
/// DESIGN.md resolves it daemon-side). `claim_filmstrip`/`release_filmstrip`
/// guard a single active-filmstrip slot shared across GPU HW Counter
/// sources.
#[derive(Default)]
pub struct FilmstripGuard {
    active: Mutex<bool>,
}

impl FilmstripGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self) -> Result<(), &'static str> {
        let mut active = self.active.lock().unwrap();
        if *active {
            return Err("a Mali Midgard filmstrip capture is already active");
        }
        *active = true;
        Ok(())
    }

    pub fn release(&self) {
        *self.active.lock().unwrap() = false;
    }
}

/// Placeholder device used when no concrete Mali vendor device has been
/// discovered. Lets `Child` always construct a `GpuHwCounterSource` in
/// dependency order (spec §4.9 step 6) without requiring real GPU hardware;
/// it simply never produces samples.
pub struct NullGpuDevice;

impl GpuDevice for NullGpuDevice {
    fn block_layout(&self) -> Vec<BlockLayout> {
        Vec::new()
    }

    fn wait_for_sample(&self) -> std::io::Result<Vec<RawCounterValue>> {
        std::thread::sleep(Duration::from_millis(200));
        Ok(Vec::new())
    }
}

pub struct GpuHwCounterSource<D: GpuDevice> {
    ring: Arc<RingBuffer>,
    device: D,
    selected: std::collections::HashSet<String>,
    key_for_name: std::collections::HashMap<String, u32>,
    sample_period: Duration,
    interrupted: AtomicBool,
    session: Arc<Session>,
}

impl<D: GpuDevice> GpuHwCounterSource<D> {
    pub fn new(
        session: Arc<Session>,
        reader_sem: Arc<Semaphore>,
        device: D,
        selected: std::collections::HashSet<String>,
        key_for_name: std::collections::HashMap<String, u32>,
    ) -> Self {
        let ring = Arc::new(RingBuffer::new(
            -1,
            FrameType::BlockCounter,
            1 << 16,
            session.one_shot,
            reader_sem,
        ));
        let sample_period = sample_period_for(session.sample_rate);
        GpuHwCounterSource {
            ring,
            device,
            selected,
            key_for_name,
            sample_period,
            interrupted: AtomicBool::new(false),
            session,
        }
    }

    pub fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    pub fn start(self: Arc<Self>) -> std::thread::JoinHandle<()>
    where
        D: 'static,
    {
        std::thread::Builder::new()
            .name("gatord-gpu".into())
            .spawn(move || self.run())
            .expect("spawn gpu source thread")
    }

    fn run(self: Arc<Self>) {
        crate::set_thread_name("gatord-gpu");
        while !self.session.has_started() && !self.interrupted.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(5));
        }
        let layout = self.device.block_layout();
        while !self.interrupted.load(Ordering::Acquire) {
            if let Ok(raw) = self.device.wait_for_sample() {
                self.emit(&layout, &raw, crate::monotonic_now_ns());
            }
            std::thread::sleep(self.sample_period);
        }
        self.ring.set_done();
    }

    fn emit(&self, layout: &[BlockLayout], raw: &[RawCounterValue], now_ns: i64) {
        let combined = combine_samples(layout, raw, &self.selected);
        if combined.is_empty() {
            return;
        }
        self.ring.wait_for_space(combined.len() * 24 + 16);
        let tok = self.ring.begin_frame();
        self.ring.event_header(now_ns);
        for (name, _block_index, value) in combined {
            let Some(&key) = self.key_for_name.get(&name) else {
                continue;
            };
            self.ring.pack_int(key as i32);
            self.ring.pack_int64(value as i64);
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

/// `1s / sample_rate`, or 10 Hz when sample rate is `none` (spec §4.8).
fn sample_period_for(rate: SampleRate) -> Duration {
    match rate {
        SampleRate::None => Duration::from_millis(100),
        other => Duration::from_millis(1000 / other.hz().max(1) as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDevice {
        layout: Vec<BlockLayout>,
        samples: Mutex<Vec<Vec<RawCounterValue>>>,
    }

    impl GpuDevice for FakeDevice {
        fn block_layout(&self) -> Vec<BlockLayout> {
            self.layout.clone()
        }
        fn wait_for_sample(&self) -> std::io::Result<Vec<RawCounterValue>> {
            Ok(self.samples.lock().unwrap().pop().unwrap_or_default())
        }
    }

    fn shader_layout() -> Vec<BlockLayout> {
        vec![BlockLayout {
            block_index: 0,
            kind: BlockKind::ShaderCore,
            counter_names: vec!["gpu_active_cycles".to_string()],
        }]
    }

    #[test]
    fn shader_core_counters_are_averaged_across_cores() {
        let layout = shader_layout();
        let raw = vec![
            RawCounterValue { block_index: 0, counter_index: 0, core_index: 0, value: 100 },
            RawCounterValue { block_index: 0, counter_index: 0, core_index: 1, value: 300 },
        ];
        let selected = std::collections::HashSet::new();
        let combined = combine_samples(&layout, &raw, &selected);
        assert_eq!(combined, vec![("gpu_active_cycles".to_string(), 0, 200)]);
    }

    #[test]
    fn mmu_l2_counters_are_summed_across_blocks() {
        let layout = vec![BlockLayout {
            block_index: 1,
            kind: BlockKind::MmuL2,
            counter_names: vec!["l2_read_lookups".to_string()],
        }];
        let raw = vec![
            RawCounterValue { block_index: 1, counter_index: 0, core_index: 0, value: 10 },
            RawCounterValue { block_index: 1, counter_index: 0, core_index: 1, value: 20 },
        ];
        let selected = std::collections::HashSet::new();
        let combined = combine_samples(&layout, &raw, &selected);
        assert_eq!(combined, vec![("l2_read_lookups".to_string(), 1, 30)]);
    }

    #[test]
    fn unselected_counters_are_dropped() {
        let layout = shader_layout();
        let raw = vec![RawCounterValue { block_index: 0, counter_index: 0, core_index: 0, value: 1 }];
        let mut selected = std::collections::HashSet::new();
        selected.insert("something_else".to_string());
        let combined = combine_samples(&layout, &raw, &selected);
        assert!(combined.is_empty());
    }

    #[test]
    fn filmstrip_guard_rejects_second_concurrent_claim() {
        let guard = FilmstripGuard::new();
        guard.claim().unwrap();
        assert!(guard.claim().is_err());
        guard.release();
        assert!(guard.claim().is_ok());
    }

    #[test]
    fn emit_writes_only_known_keys() {
        let session = {
            let s = Session::new();
            s.mark_started(1);
            Arc::new(s)
        };
        let mut key_for_name = std::collections::HashMap::new();
        key_for_name.insert("gpu_active_cycles".to_string(), 7);
        let device = FakeDevice {
            layout: shader_layout(),
            samples: Mutex::new(vec![]),
        };
        let source = GpuHwCounterSource::new(
            session,
            Arc::new(Semaphore::new(0)),
            device,
            std::collections::HashSet::new(),
            key_for_name,
        );
        let raw = vec![RawCounterValue { block_index: 0, counter_index: 0, core_index: 0, value: 42 }];
        source.emit(&shader_layout(), &raw, 100);
        assert!(source.ring.bytes_available() > 0);
    }
}

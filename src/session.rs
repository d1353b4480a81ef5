//! Data model (spec §3): `Session`, `Counter`, `PerfEvent`, `PerfGroup`,
//! `CapturedSPE`.
//!
//! Styled on `linnix_ai_ebpf_common::lib.rs`'s wire-struct idiom (plain
//! `#[repr(C)]`/plain structs with explicit field lists, a handful of small
//! enums for bitflag-ish fields) without the `bytemuck`/eBPF-map plumbing
//! that crate needed — these structs never cross an eBPF map boundary, only
//! get constructed from XML+CLI and read by the sources.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRate {
    None,
    Low,
    Normal,
    High,
}

impl SampleRate {
    /// Samples per second implied by this rate, used by C8's periodic timer.
    pub fn hz(self) -> u32 {
        match self {
            SampleRate::None => 10,
            SampleRate::Low => 100,
            SampleRate::Normal => 1_000,
            SampleRate::High => 10_000,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SampleRate::None),
            "low" => Some(SampleRate::Low),
            "normal" => Some(SampleRate::Normal),
            "high" => Some(SampleRate::High),
            _ => None,
        }
    }
}

/// A driver-exposed counter, resolved from the XML catalog plus CLI
/// overrides (spec §3 `Counter`).
#[derive(Debug, Clone)]
pub struct Counter {
    pub name: String,
    /// Stable small integer; the only identifier that crosses the wire.
    pub key: u32,
    /// -1 once resolution fails; such a counter is disabled (spec §4.5.2).
    pub event_code: i64,
    /// 0 means not event-based (time-based instead).
    pub sampling_period: u64,
    pub core_count: u32,
    pub driver: String,
}

impl Counter {
    pub fn is_enabled(&self) -> bool {
        self.event_code != -1
    }
}

/// Group flags selecting leader/per-cpu/pinned/etc (spec §3 `PerfEvent`).
/// Hand-rolled newtype bitflags, matching `linnix_ai_ebpf_common`'s
/// `PageFaultFlags(pub u32)` pattern rather than pulling in a crate for
/// five constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupFlags(pub u32);

impl GroupFlags {
    pub const LEADER: GroupFlags = GroupFlags(1 << 0);
    pub const PER_CPU: GroupFlags = GroupFlags(1 << 1);
    pub const PINNED_CLUSTER: GroupFlags = GroupFlags(1 << 2);
    pub const SAMPLE_ID_ALL: GroupFlags = GroupFlags(1 << 3);
    pub const INCLUDE_KERNEL: GroupFlags = GroupFlags(1 << 4);

    pub fn contains(self, other: GroupFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for GroupFlags {
    type Output = GroupFlags;
    fn bitor(self, rhs: GroupFlags) -> GroupFlags {
        GroupFlags(self.0 | rhs.0)
    }
}

/// A single perf_event_open attribute, pre-resolution (spec §3 `PerfEvent`).
#[derive(Debug, Clone)]
pub struct PerfEvent {
    pub perf_type: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub flags: GroupFlags,
    pub cluster: u32,
    pub key: u32,
    pub secondary_config_id: Option<u64>,
}

/// Ordered group of events sharing one mmap'd kernel ring, leader first
/// (spec §3 `PerfGroup`).
#[derive(Debug, Clone)]
pub struct PerfGroup {
    pub cluster: u32,
    pub events: Vec<PerfEvent>,
}

impl PerfGroup {
    pub fn leader(&self) -> Option<&PerfEvent> {
        self.events.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpeOps(pub u32);

impl SpeOps {
    pub const LOAD: SpeOps = SpeOps(1 << 0);
    pub const STORE: SpeOps = SpeOps(1 << 1);
    pub const BRANCH: SpeOps = SpeOps(1 << 2);

    pub fn contains(self, other: SpeOps) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for SpeOps {
    type Output = SpeOps;
    fn bitor(self, rhs: SpeOps) -> SpeOps {
        SpeOps(self.0 | rhs.0)
    }
}

/// Statistical Profiling Extension configuration (spec §3 `CapturedSPE`).
#[derive(Debug, Clone)]
pub struct CapturedSpe {
    pub id: u32,
    pub event_filter_mask: u64,
    pub ops: SpeOps,
    /// Clamped to [0, 4096) by the caller.
    pub min_latency: u16,
}

/// Singleton per Child process (spec §3 `Session`). Always shared via
/// `Arc<Session>` rather than cloned — `monotonic_started_ns` is the one
/// piece of mutable state every source observes, so there is exactly one
/// instance per capture session.
#[derive(Debug)]
pub struct Session {
    pub system_wide: bool,
    pub one_shot: bool,
    pub duration_seconds: u32,
    pub sample_rate: SampleRate,
    pub backtrace_depth: u32,
    pub mmap_size_pages: u32,
    pub captured_pids: Vec<i32>,
    pub wait_for_process_name: Option<String>,
    /// `--app CMD ARGS...`; empty unless the Child should fork+exec a
    /// workload itself (spec §4.9 step 4).
    pub workload_argv: Vec<String>,
    pub capture_user: Option<String>,
    pub stop_on_exit: bool,
    pub local_capture: bool,
    pub apc_dir: Option<std::path::PathBuf>,
    pub monotonic_started_ns: std::sync::atomic::AtomicI64,
    pub counters: HashMap<u32, Counter>,
    pub spe: Vec<CapturedSpe>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            system_wide: true,
            one_shot: false,
            duration_seconds: 0,
            sample_rate: SampleRate::Normal,
            backtrace_depth: 0,
            mmap_size_pages: 4,
            captured_pids: Vec::new(),
            wait_for_process_name: None,
            workload_argv: Vec::new(),
            capture_user: None,
            stop_on_exit: false,
            local_capture: false,
            apc_dir: None,
            monotonic_started_ns: std::sync::atomic::AtomicI64::new(0),
            counters: HashMap::new(),
            spe: Vec::new(),
        }
    }

    /// True once the first event is allowed to be emitted; all sources gate
    /// on this before producing (spec §5 ordering guarantees).
    pub fn has_started(&self) -> bool {
        self.monotonic_started_ns.load(std::sync::atomic::Ordering::Acquire) > 0
    }

    pub fn started_ns(&self) -> i64 {
        self.monotonic_started_ns.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn mark_started(&self, now_ns: i64) {
        self.monotonic_started_ns.store(now_ns, std::sync::atomic::Ordering::Release);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_counter_has_sentinel_event_code() {
        let c = Counter {
            name: "foo".into(),
            key: 1,
            event_code: -1,
            sampling_period: 0,
            core_count: 1,
            driver: "perf".into(),
        };
        assert!(!c.is_enabled());
    }

    #[test]
    fn session_gates_on_monotonic_started() {
        let s = Session::new();
        assert!(!s.has_started());
        s.mark_started(12345);
        assert!(s.has_started());
        assert_eq!(s.started_ns(), 12345);
    }

    #[test]
    fn sample_rate_parses_known_values() {
        assert_eq!(SampleRate::parse("normal"), Some(SampleRate::Normal));
        assert_eq!(SampleRate::parse("bogus"), None);
    }

    #[test]
    fn group_flags_compose() {
        let f = GroupFlags::LEADER | GroupFlags::PER_CPU;
        assert!(f.contains(GroupFlags::LEADER));
        assert!(f.contains(GroupFlags::PER_CPU));
        assert!(!f.contains(GroupFlags::PINNED_CLUSTER));
    }
}

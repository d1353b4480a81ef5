//! Perf Source (C5), spec §4.5 — the hardest part of the pipeline.
//!
//! Owns one `RingBuffer` per CPU (`FrameType::PerfDataPerCpu`), a
//! `Monitor` watching every active group leader plus the hot-plug netlink
//! socket, and the `OFFLINE -> ARMED -> ENABLED` state machine per CPU.
//! Submodules: `sys` (raw FFI), `detect` (capability/PMU probing), `group`
//! (activation + legacy-id fallback), `drain` (kernel ring draining),
//! `hotplug` (uevent netlink watcher).

pub mod detect;
pub mod drain;
pub mod group;
pub mod hotplug;
pub mod sys;

use std::collections::HashMap;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::unistd::{close, pipe};

use crate::frame::FrameType;
use crate::metrics::Metrics;
use crate::monitor::Monitor;
use crate::perf::group::CpuState;
use crate::ring::RingBuffer;
use crate::sem::Semaphore;
use crate::session::{PerfGroup, Session};

struct CpuRuntime {
    state: CpuState,
    mappings: Vec<group::GroupMapping>,
}

pub struct PerfSource {
    groups: Vec<PerfGroup>,
    rings: HashMap<u32, Arc<RingBuffer>>,
    cpus: Mutex<HashMap<u32, CpuRuntime>>,
    monitor: Monitor,
    interrupt_read: RawFd,
    interrupt_write: RawFd,
    interrupted: AtomicBool,
    allow_kernel: bool,
    mmap_size_pages: u32,
    session: Arc<Session>,
    metrics: Arc<Metrics>,
}

impl PerfSource {
    pub fn new(
        groups: Vec<PerfGroup>,
        online_cpus: &[u32],
        session: Arc<Session>,
        metrics: Arc<Metrics>,
        reader_sem: Arc<Semaphore>,
        mmap_size_pages: u32,
        allow_kernel: bool,
    ) -> std::io::Result<Self> {
        let monitor = Monitor::new()?;
        let (interrupt_read, interrupt_write) = pipe()?;
        monitor.add(interrupt_read.as_raw_fd())?;
        let interrupt_read = interrupt_read.into_raw_fd();
        let interrupt_write = interrupt_write.into_raw_fd();

        let mut rings = HashMap::new();
        for &cpu in online_cpus {
            let ring = Arc::new(RingBuffer::new(
                cpu as i32,
                FrameType::PerfDataPerCpu(cpu),
                1 << 20,
                session.one_shot,
                reader_sem.clone(),
            ));
            rings.insert(cpu, ring);
        }

        Ok(PerfSource {
            groups,
            rings,
            cpus: Mutex::new(HashMap::new()),
            monitor,
            interrupt_read,
            interrupt_write,
            interrupted: AtomicBool::new(false),
            allow_kernel,
            mmap_size_pages,
            session,
            metrics,
        })
    }

    /// `prepare()`: opens every group on every CPU, transitioning
    /// OFFLINE -> ARMED. An error here is fatal for the session, matching
    /// spec §4.9 step 6 ("Each source's `prepare()` is an error if it
    /// fails").
    pub fn prepare(&self) -> anyhow::Result<()> {
        let mut cpus = self.cpus.lock().unwrap();
        for &cpu in self.rings.keys() {
            let mut mappings = Vec::new();
            for group in &self.groups {
                if group.events.is_empty() {
                    continue;
                }
                let leader_attr = perf_event_attr_for(&group.events[0]);
                let sibling_attrs: Vec<_> =
                    group.events[1..].iter().map(perf_event_attr_for).collect();
                let mapping = group::activate_group(
                    &group.events,
                    leader_attr,
                    &sibling_attrs,
                    if self.session.system_wide { -1 } else { 0 },
                    cpu as libc::c_int,
                    self.mmap_size_pages,
                    self.allow_kernel,
                )?;
                self.monitor.add(mapping.leader_fd)?;
                mappings.push(mapping);
            }
            cpus.insert(
                cpu,
                CpuRuntime {
                    state: CpuState::Armed,
                    mappings,
                },
            );
        }
        Ok(())
    }

    /// `online_cpu`: ARMED -> ENABLED.
    pub fn online_cpu(&self, cpu: u32) -> std::io::Result<()> {
        let mut cpus = self.cpus.lock().unwrap();
        if let Some(runtime) = cpus.get_mut(&cpu) {
            for mapping in &runtime.mappings {
                group::online(mapping)?;
            }
            runtime.state = CpuState::Enabled;
            self.metrics.inc_cpu_hotplug_events();
        }
        Ok(())
    }

    /// `offline_cpu`: disables, drains once more, closes fds, munmaps.
    pub fn offline_cpu(&self, cpu: u32) -> std::io::Result<()> {
        let mut cpus = self.cpus.lock().unwrap();
        if let Some(mut runtime) = cpus.remove(&cpu) {
            if let Some(ring) = self.rings.get(&cpu) {
                for mapping in &runtime.mappings {
                    let _ = group::offline(mapping);
                    drain::Drainer::new(mapping, cpu).drain(ring, now_ns(), &self.metrics);
                }
            }
            for mapping in runtime.mappings.drain(..) {
                let _ = self.monitor.remove(mapping.leader_fd);
                group::close_group(mapping);
            }
            self.metrics.inc_cpu_hotplug_events();
        }
        Ok(())
    }

    /// `start()`: spawns the drain thread. Runs until `interrupt()`.
    pub fn start(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("gatord-perf".into())
            .spawn(move || self.run())
            .expect("spawn perf source thread")
    }

    fn run(self: Arc<Self>) {
        crate::set_thread_name("gatord-perf");
        while !self.interrupted.load(Ordering::Acquire) {
            let ready = match self.monitor.wait(64, 1000) {
                Ok(r) => r,
                Err(_) => continue,
            };
            for r in ready {
                if r.fd == self.interrupt_read {
                    continue; // interrupted flag already checked above
                }
                self.drain_fd(r.fd);
            }
        }
        for ring in self.rings.values() {
            ring.set_done();
        }
    }

    fn drain_fd(&self, fd: RawFd) {
        let cpus = self.cpus.lock().unwrap();
        for (cpu, runtime) in cpus.iter() {
            if let Some(mapping) = runtime.mappings.iter().find(|m| m.leader_fd == fd) {
                if let Some(ring) = self.rings.get(cpu) {
                    drain::Drainer::new(mapping, *cpu).drain(ring, now_ns(), &self.metrics);
                }
                return;
            }
        }
    }

    /// Unblocks the drain thread via the self-pipe (spec §5
    /// "Cancellation").
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        unsafe {
            libc::write(self.interrupt_write, [0u8].as_ptr() as *const libc::c_void, 1);
        }
    }

    pub fn is_done(&self) -> bool {
        self.rings.values().all(|r| r.is_done())
    }

    /// Drains every per-CPU ring's committed bytes to `sink` (called by the
    /// Child's sender thread once per wake).
    pub fn write<S: crate::ring::RingSink>(&self, sink: &S) -> std::io::Result<usize> {
        let mut total = 0;
        for ring in self.rings.values() {
            total += ring.write(sink)?;
        }
        Ok(total)
    }
}

impl Drop for PerfSource {
    fn drop(&mut self) {
        let _ = close(self.interrupt_read);
        let _ = close(self.interrupt_write);
    }
}

fn perf_event_attr_for(event: &crate::session::PerfEvent) -> sys::PerfEventAttr {
    let mut attr = sys::PerfEventAttr::new(event.perf_type, event.config);
    attr.sample_period_or_freq = event.sample_period;
    attr.sample_type = event.sample_type;
    attr.read_format = sys::PERF_FORMAT_ID | sys::PERF_FORMAT_GROUP;
    attr.set_flag(sys::attr_flag::SAMPLE_ID_ALL, event.flags.contains(crate::session::GroupFlags::SAMPLE_ID_ALL));
    attr
}

use crate::monotonic_now_ns as now_ns;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{GroupFlags, PerfEvent};

    fn dummy_session() -> Arc<Session> {
        Arc::new(Session::new())
    }

    #[test]
    fn new_source_creates_one_ring_per_cpu() {
        let groups = vec![PerfGroup {
            cluster: 0,
            events: vec![PerfEvent {
                perf_type: sys::PERF_TYPE_SOFTWARE,
                config: 1,
                sample_period: 1_000_000,
                sample_type: sys::PERF_SAMPLE_IP,
                flags: GroupFlags::LEADER,
                cluster: 0,
                key: 1,
                secondary_config_id: None,
            }],
        }];
        let source = PerfSource::new(
            groups,
            &[0, 1],
            dummy_session(),
            Arc::new(Metrics::new()),
            Arc::new(Semaphore::new(0)),
            4,
            false,
        )
        .unwrap();
        assert_eq!(source.rings.len(), 2);
        assert!(!source.is_done());
    }

    #[test]
    fn interrupt_sets_flag() {
        let source = PerfSource::new(
            vec![],
            &[0],
            dummy_session(),
            Arc::new(Metrics::new()),
            Arc::new(Semaphore::new(0)),
            4,
            false,
        )
        .unwrap();
        source.interrupt();
        assert!(source.interrupted.load(Ordering::Acquire));
    }
}

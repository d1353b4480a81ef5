//! Child process (C9), spec §4.9 — the capture session lifecycle.
//!
//! One `Child` per capture session: resolves the session into perf groups
//! and SPE claims, constructs the four sources in dependency order
//! (Primary → External → GPU → User-Space), runs a sender thread draining
//! them in the fixed order External → GPU → User-Space → Primary, and
//! tears everything down exactly once no matter which of {duration
//! elapsed, host requested stop, signal} triggered it.
//!
//! Grounded on `cognitod/src/main.rs`'s top-level orchestration (spawn
//! long-lived tasks, wait on a shutdown signal, join everything before
//! exiting) translated from `tokio::signal::unix` to a raw `sigaction` +
//! self-pipe, per REDESIGN FLAGS: the original's `atomic<Child*>` singleton
//! and goto-style unwind become an owned `Arc<Child>` plus an
//! async-signal-safe write to a pipe, read back on an ordinary thread where
//! it's safe to join other threads and touch non-atomic state.

use std::io::Read;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{close, pipe};

use crate::annotate::AnnotateListener;
use crate::error::ExitCode;
use crate::external::ExternalSource;
use crate::frame::{packet, read_request_header, RequestType, ResponseType};
use crate::gpu::{FilmstripGuard, GpuHwCounterSource, NullGpuDevice};
use crate::metrics::Metrics;
use crate::monitor::Monitor;
use crate::perf::sys as perf_sys;
use crate::perf::PerfSource;
use crate::sem::Semaphore;
use crate::sender::Sender;
use crate::session::{CapturedSpe, GroupFlags, PerfEvent, PerfGroup, Session};
use crate::userspace::UserSpaceSource;

/// Reserved SPE id treated as a Mali Midgard filmstrip capture (spec.md Open
/// Questions #2; DESIGN.md resolves the "only one at a time" rule daemon
/// side).
pub const FILMSTRIP_SPE_ID: u32 = 0;

/// Claims SPE configs in priority order (ascending id), rejecting a second
/// concurrent filmstrip claim.
pub fn claim_spe_configs(
    configs: &[CapturedSpe],
    filmstrip: &FilmstripGuard,
) -> Result<Vec<CapturedSpe>, String> {
    let mut ordered = configs.to_vec();
    ordered.sort_by_key(|c| c.id);
    for config in &ordered {
        if config.id == FILMSTRIP_SPE_ID {
            filmstrip.claim()?;
        }
    }
    Ok(ordered)
}

/// One `PerfGroup` per enabled counter: this crate doesn't model multiplexed
/// sibling groups (spec.md's `PerfGroup` allows it, but nothing in
/// SPEC_FULL.md requires grouping counters together), so each leader is its
/// own single-event group.
fn build_perf_groups(session: &Session) -> Vec<PerfGroup> {
    let mut counters: Vec<_> = session.counters.values().collect();
    counters.sort_by_key(|c| c.key);
    counters
        .into_iter()
        .filter(|c| c.is_enabled())
        .map(|counter| PerfGroup {
            cluster: 0,
            events: vec![PerfEvent {
                perf_type: perf_sys::PERF_TYPE_RAW,
                config: counter.event_code as u64,
                sample_period: counter.sampling_period.max(1),
                sample_type: perf_sys::PERF_SAMPLE_TID
                    | perf_sys::PERF_SAMPLE_TIME
                    | perf_sys::PERF_SAMPLE_READ,
                flags: GroupFlags::LEADER | GroupFlags::SAMPLE_ID_ALL,
                cluster: 0,
                key: counter.key,
                secondary_config_id: None,
            }],
        })
        .collect()
}

/// Parses `/sys/devices/system/cpu/online`'s `N-M,K` range syntax (spec
/// §4.5.6's hotplug watcher assumes the same online-set shape at startup).
pub fn online_cpus() -> Vec<u32> {
    let Ok(raw) = std::fs::read_to_string("/sys/devices/system/cpu/online") else {
        return vec![0];
    };
    parse_cpu_list(raw.trim())
}

fn parse_cpu_list(s: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in s.split(',').filter(|p| !p.is_empty()) {
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(n) = part.parse::<u32>() {
            cpus.push(n);
        }
    }
    if cpus.is_empty() {
        cpus.push(0);
    }
    cpus
}

/// Launches the optional `--app` workload: pipe-synchronized fork so the
/// child only `execvp`s once the parent has finished wiring up perf events
/// against its still-stopped pid, with an optional privilege drop and
/// working-directory change (spec §4.9 step 4).
pub struct WorkloadLaunch {
    pub pid: i32,
    sync_write: RawFd,
}

impl WorkloadLaunch {
    pub fn spawn(
        argv: &[String],
        capture_user: Option<&str>,
        chdir: Option<&std::path::Path>,
    ) -> anyhow::Result<Self> {
        use nix::unistd::ForkResult;
        anyhow::ensure!(!argv.is_empty(), "--app requires at least one argument");

        let (sync_read, sync_write) = pipe()?;
        match unsafe { nix::unistd::fork() }? {
            ForkResult::Parent { child } => {
                let _ = close(sync_read.into_raw_fd());
                Ok(WorkloadLaunch {
                    pid: child.as_raw(),
                    sync_write: sync_write.into_raw_fd(),
                })
            }
            ForkResult::Child => {
                let _ = close(sync_write.into_raw_fd());
                let mut byte = [0u8; 1];
                let _ = nix::unistd::read(sync_read.as_raw_fd(), &mut byte);

                if let Some(dir) = chdir {
                    let _ = nix::unistd::chdir(dir);
                }
                if let Some(user) = capture_user {
                    drop_privileges(user);
                }
                unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 0) };

                let c_argv: Vec<std::ffi::CString> = argv
                    .iter()
                    .map(|a| std::ffi::CString::new(a.as_str()).unwrap())
                    .collect();
                let argv_refs: Vec<&std::ffi::CStr> = c_argv.iter().map(|a| a.as_c_str()).collect();
                let _ = nix::unistd::execvp(c_argv[0].as_c_str(), &argv_refs);
                std::process::exit(127);
            }
        }
    }

    /// Releases the fork-sync pipe, letting the child proceed to `execvp`
    /// (spec §4.9 step 4: "held until perf events targeting that pid are
    /// armed").
    pub fn release(self) {
        unsafe {
            libc::write(self.sync_write, [0u8].as_ptr() as *const libc::c_void, 1);
        }
        let _ = close(self.sync_write);
    }
}

fn drop_privileges(user: &str) {
    let Ok(Some(entry)) = nix::unistd::User::from_name(user) else {
        return;
    };
    let _ = nix::unistd::setgid(entry.gid);
    let _ = nix::unistd::setuid(entry.uid);
}

/// Polls `/proc/*/comm` until a process named `name` appears (spec §4.9
/// step 5 "Wait-for-process-name").
pub fn wait_for_process_name(name: &str, poll: Duration, deadline: Duration) -> Option<i32> {
    let start = std::time::Instant::now();
    loop {
        if let Some(pid) = find_process_by_name(name) {
            return Some(pid);
        }
        if start.elapsed() > deadline {
            return None;
        }
        std::thread::sleep(poll);
    }
}

fn find_process_by_name(name: &str) -> Option<i32> {
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let comm = std::fs::read_to_string(entry.path().join("comm")).ok()?;
        if comm.trim() == name {
            return Some(pid);
        }
    }
    None
}

static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_relay(signum: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [signum as u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Installs SIGINT/SIGTERM/SIGABRT/SIGALRM handlers that only write the
/// signal number to a self-pipe, and returns its read end (spec §4.9 step 2,
/// REDESIGN FLAGS: async-signal-safe shutdown path).
fn install_signal_handlers() -> std::io::Result<RawFd> {
    let (read_end, write_end) = pipe()?;
    SIGNAL_WRITE_FD.store(write_end.into_raw_fd(), Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(signal_relay),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGABRT, Signal::SIGALRM] {
        unsafe {
            signal::sigaction(sig, &action).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, format!("sigaction failed: {e}"))
            })?;
        }
    }
    Ok(read_end.into_raw_fd())
}

pub struct Child {
    session: Arc<Session>,
    metrics: Arc<Metrics>,
    sender: Arc<Sender>,
    annotate_listener: Arc<AnnotateListener>,
    reader_sem: Arc<Semaphore>,
    halt_pipeline: Arc<Semaphore>,

    perf: Option<Arc<PerfSource>>,
    external: Option<Arc<ExternalSource>>,
    userspace: Option<Arc<UserSpaceSource>>,
    gpu: Option<Arc<GpuHwCounterSource<NullGpuDevice>>>,
    source_count: usize,

    shutdown_requested: AtomicBool,
    ended: AtomicBool,
    filmstrip: FilmstripGuard,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    /// Live-capture only (spec §4.9 step 9): the other half of the host
    /// connection `sender` writes to, read independently by the stop
    /// thread. `None` for local capture, where there is no host socket.
    stop_reader: Mutex<Option<Box<dyn Read + Send>>>,
    /// Raw fd backing `stop_reader`, kept outside its `Mutex` so
    /// `end_session()` can shut down the read side and unblock a stop
    /// thread that's mid-`read_exact` even after the reader itself has
    /// been moved into that thread. -1 when there is no host socket.
    stop_fd: AtomicI32,
}

impl Child {
    pub fn new(
        session: Arc<Session>,
        metrics: Arc<Metrics>,
        sender: Arc<Sender>,
        annotate_listener: Arc<AnnotateListener>,
        stop_reader: Option<(RawFd, Box<dyn Read + Send>)>,
    ) -> anyhow::Result<Arc<Self>> {
        let stop_fd = stop_reader.as_ref().map(|(fd, _)| *fd).unwrap_or(-1);
        let stop_reader = stop_reader.map(|(_, reader)| reader);
        let reader_sem = Arc::new(Semaphore::new(0));
        let halt_pipeline = Arc::new(Semaphore::new(0));

        let groups = build_perf_groups(&session);
        let cpus = online_cpus();
        let perf = Arc::new(PerfSource::new(
            groups,
            &cpus,
            session.clone(),
            metrics.clone(),
            reader_sem.clone(),
            session.mmap_size_pages,
            false,
        )?);

        let external = Arc::new(ExternalSource::new(
            session.clone(),
            metrics.clone(),
            reader_sem.clone(),
            annotate_listener.clone(),
            true,
        )?);

        let userspace = Arc::new(UserSpaceSource::new(session.clone(), reader_sem.clone(), vec![]));

        let gpu = Arc::new(GpuHwCounterSource::new(
            session.clone(),
            reader_sem.clone(),
            NullGpuDevice,
            std::collections::HashSet::new(),
            std::collections::HashMap::new(),
        ));

        let source_count = 4;

        Ok(Arc::new(Child {
            session,
            metrics,
            sender,
            annotate_listener,
            reader_sem,
            halt_pipeline,
            perf: Some(perf),
            external: Some(external),
            userspace: Some(userspace),
            gpu: Some(gpu),
            source_count,
            shutdown_requested: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            filmstrip: FilmstripGuard::new(),
            threads: Mutex::new(Vec::new()),
            stop_reader: Mutex::new(stop_reader),
            stop_fd: AtomicI32::new(stop_fd),
        }))
    }

    /// Claims SPE configs against this child's filmstrip guard, erroring if
    /// two concurrent filmstrip captures are requested (spec.md Open
    /// Questions #2).
    pub fn claim_spe(&self) -> Result<Vec<CapturedSpe>, String> {
        claim_spe_configs(&self.session.spe, &self.filmstrip)
    }

    /// Spec §4.9 steps 3-5: claim SPE configs, optionally fork the `--app`
    /// workload (held at the sync pipe until `start()` has armed every
    /// source against its pid), and optionally wait for `--wait-process`.
    /// Claim conflicts are logged and otherwise ignored — the session still
    /// runs with whatever SPE configs it did claim.
    fn launch_workload(self: &Arc<Self>) -> anyhow::Result<Option<WorkloadLaunch>> {
        if let Err(e) = self.claim_spe() {
            log::warn!("unclaimed SPE config: {e}");
        }

        let launch = if self.session.workload_argv.is_empty() {
            None
        } else {
            Some(WorkloadLaunch::spawn(
                &self.session.workload_argv,
                self.session.capture_user.as_deref(),
                None,
            )?)
        };

        if let Some(name) = &self.session.wait_for_process_name {
            if wait_for_process_name(name, Duration::from_millis(100), Duration::from_secs(30)).is_none() {
                log::warn!("--wait-process {name}: no matching process appeared before the deadline");
            }
        }

        Ok(launch)
    }

    /// Waits for the `--app` workload to exit, reaping it, and — if
    /// `--stop-on-exit yes` — ends the session (spec §4.9 step 4: "the
    /// parent thread ... invokes the termination callback which optionally
    /// ends the session").
    fn wait_for_workload_exit(self: Arc<Self>, pid: i32) {
        crate::set_thread_name("gatord-workload");
        let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None);
        if self.session.stop_on_exit {
            self.end_session();
        }
    }

    /// `prepare()` + `start()` for every constructed source, in dependency
    /// order Primary → External → GPU → User-Space (spec §4.9 step 6).
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if let Some(perf) = &self.perf {
            perf.prepare()?;
        }
        if let Some(external) = &self.external {
            external.prepare()?;
        }
        if let Some(gpu) = &self.gpu {
            gpu.prepare()?;
        }
        if let Some(userspace) = &self.userspace {
            userspace.prepare()?;
        }

        let mut threads = self.threads.lock().unwrap();
        if let Some(perf) = self.perf.clone() {
            threads.push(perf.start());
        }
        if let Some(external) = self.external.clone() {
            threads.push(external.start());
        }
        if let Some(gpu) = self.gpu.clone() {
            threads.push(gpu.start());
        }
        if let Some(userspace) = self.userspace.clone() {
            threads.push(userspace.start());
        }
        drop(threads);

        self.session.mark_started(crate::monotonic_now_ns());
        self.emit_summary();
        Ok(())
    }

    /// Host stop-thread (spec §4.9 step 9): blocks on 5-byte request
    /// headers from the host connection. `APC_STOP` ends the session; a
    /// zero-length `PING` is ACKed; anything else, or the socket closing,
    /// is logged and the loop exits (a closed socket is itself
    /// end-of-session, spec §5 "Cancellation and timeouts").
    fn stop_loop(self: Arc<Self>, mut reader: Box<dyn Read + Send>) {
        crate::set_thread_name("gatord-stop");
        loop {
            let mut header = [0u8; 5];
            if reader.read_exact(&mut header).is_err() {
                break;
            }
            let (cmd, len) = read_request_header(&header);
            let mut payload = vec![0u8; len as usize];
            if len > 0 && reader.read_exact(&mut payload).is_err() {
                break;
            }
            match RequestType::from_byte(cmd) {
                Some(RequestType::ApcStop) => break,
                Some(RequestType::Ping) if len == 0 => {
                    let _ = self.sender.write_data(&[], ResponseType::Ack, true);
                }
                _ => {
                    log::warn!("ignoring unexpected request {cmd} (len {len}) on stop channel");
                }
            }
        }
        self.end_session();
        unsafe {
            libc::kill(libc::getppid(), libc::SIGUSR1);
        }
    }

    fn emit_summary(&self) {
        let now = crate::monotonic_now_ns();
        let body = packet::summary(
            realtime_now_ns(),
            now,
            self.session.started_ns(),
            &crate::apc::uname_string(),
            page_size(),
            &[],
        );
        let _ = self.sender.write_data(&body, crate::frame::ResponseType::ApcData, false);
    }

    /// Drains External → GPU → User-Space → Primary into the sender, the
    /// fixed order spec §5 requires.
    fn drain_once(&self) -> std::io::Result<usize> {
        let mut total = 0;
        if let Some(external) = &self.external {
            total += external.write(self.sender.as_ref())?;
        }
        if let Some(gpu) = &self.gpu {
            total += gpu.write(self.sender.as_ref())?;
        }
        if let Some(userspace) = &self.userspace {
            total += userspace.write(self.sender.as_ref())?;
        }
        if let Some(perf) = &self.perf {
            total += perf.write(self.sender.as_ref())?;
        }
        if total > 0 {
            self.metrics.record_frame(total as u64);
        }
        Ok(total)
    }

    /// The sender thread: wakes on `reader_sem` (posted by any ring's
    /// `commit()`), drains in fixed order, and after shutdown has been
    /// requested waits for every source's `halt_pipeline` post before the
    /// absolute final drain and (live-capture only) terminator frame (spec
    /// §4.9 step 8; DESIGN.md's `halt_pipeline` resolution).
    fn sender_loop(self: Arc<Self>) {
        crate::set_thread_name("gatord-sender");
        loop {
            self.reader_sem.wait_timeout(Duration::from_millis(200));
            let _ = self.drain_once();
            if self.shutdown_requested.load(Ordering::Acquire) {
                let mut posts = 0;
                while posts < self.source_count && self.halt_pipeline.wait_timeout(Duration::from_millis(50)) {
                    posts += 1;
                }
                if posts >= self.source_count {
                    break;
                }
            }
        }
        let _ = self.drain_once();
        if !self.session.local_capture {
            let _ = self.sender.write_terminator();
        }
    }

    /// Runs the session to completion: claims SPE configs, optionally forks
    /// the `--app` workload and waits for `--wait-process`, starts every
    /// source, spawns the sender thread, installs signal handling, and
    /// blocks until `end_session()` has fully drained and joined
    /// everything. Returns the exit code the caller (Supervisor or direct
    /// CLI invocation) should exit with.
    pub fn run(self: &Arc<Self>) -> anyhow::Result<ExitCode> {
        let workload = self.launch_workload()?;
        self.start()?;

        // Release the workload's sync pipe only now that every source is
        // armed against its pid (spec §4.9 step 4).
        let workload_handle = workload.map(|launch| {
            let pid = launch.pid;
            launch.release();
            let this = self.clone();
            std::thread::Builder::new()
                .name("gatord-workload".into())
                .spawn(move || this.wait_for_workload_exit(pid))
                .expect("spawn workload watcher thread")
        });

        let sender_handle = {
            let this = self.clone();
            std::thread::Builder::new()
                .name("gatord-sender".into())
                .spawn(move || this.sender_loop())?
        };

        let stop_handle = self.stop_reader.lock().unwrap().take().map(|reader| {
            let this = self.clone();
            std::thread::Builder::new()
                .name("gatord-stop".into())
                .spawn(move || this.stop_loop(reader))
                .expect("spawn stop thread")
        });

        let signal_read_fd = install_signal_handlers()?;
        let monitor = Monitor::new()?;
        monitor.add(signal_read_fd)?;

        let duration = self.session.duration_seconds;
        let deadline = if duration > 0 {
            Some(std::time::Instant::now() + Duration::from_secs(duration as u64))
        } else {
            None
        };

        // Once the first shutdown trigger fires, `end_session()`'s
        // join-every-source-thread drain runs on its own thread so this
        // loop keeps servicing the signal pipe: a second SIGINT/SIGTERM/
        // SIGABRT arriving mid-drain forces an immediate `_exit` instead of
        // being silently absorbed by the pipe (spec §4.9 step 7, scenario
        // S5), and the alarm watchdog firing mid-drain forces the same.
        let mut end_session_handle: Option<std::thread::JoinHandle<()>> = None;

        let exit_code = loop {
            if let Some(handle) = &end_session_handle {
                if handle.is_finished() {
                    break ExitCode::Ok;
                }
            } else if self.ended.load(Ordering::Acquire) {
                // Ended via the stop thread (host APC_STOP) rather than a
                // signal; the join below still waits for it to finish.
                break ExitCode::Ok;
            } else if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    let this = self.clone();
                    end_session_handle = Some(
                        std::thread::Builder::new()
                            .name("gatord-end-session".into())
                            .spawn(move || this.end_session())?,
                    );
                    continue;
                }
            }

            let timeout_ms = deadline
                .map(|d| d.saturating_duration_since(std::time::Instant::now()).as_millis() as isize)
                .unwrap_or(1000)
                .min(1000);
            let ready = monitor.wait(4, timeout_ms.max(0))?;
            let mut saw_signal = None;
            for r in ready {
                if r.fd == signal_read_fd {
                    let mut buf = [0u8; 16];
                    if let Ok(n) = nix::unistd::read(signal_read_fd, &mut buf) {
                        saw_signal = buf[..n].last().copied();
                    }
                }
            }
            match saw_signal {
                Some(s) if s as i32 == Signal::SIGALRM as i32 => {
                    if end_session_handle.is_some() {
                        unsafe { libc::_exit(ExitCode::Alarm as i32) };
                    }
                    break ExitCode::Alarm;
                }
                Some(_) if end_session_handle.is_some() => {
                    unsafe { libc::_exit(ExitCode::SecondSignal as i32) };
                }
                Some(_) => {
                    let this = self.clone();
                    end_session_handle = Some(
                        std::thread::Builder::new()
                            .name("gatord-end-session".into())
                            .spawn(move || this.end_session())?,
                    );
                }
                None => {}
            }
        };

        if let Some(handle) = end_session_handle {
            let _ = handle.join();
        }
        let _ = sender_handle.join();
        if let Some(handle) = stop_handle {
            let _ = handle.join();
        }
        if let Some(handle) = workload_handle {
            let _ = handle.join();
        }
        let _ = close(signal_read_fd);
        Ok(exit_code)
    }

    /// Idempotent shutdown: interrupts every source, joins their threads
    /// (posting `halt_pipeline` once per source as each join completes, per
    /// DESIGN.md's resolution), then arms a 5-second watchdog `SIGALRM` in
    /// case draining stalls (spec §4.9 step 7).
    pub fn end_session(self: &Arc<Self>) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_requested.store(true, Ordering::Release);

        let stop_fd = self.stop_fd.load(Ordering::Acquire);
        if stop_fd >= 0 {
            unsafe {
                libc::shutdown(stop_fd, libc::SHUT_RD);
            }
        }

        if let Some(external) = &self.external {
            external.interrupt();
        }
        if let Some(gpu) = &self.gpu {
            gpu.interrupt();
        }
        if let Some(userspace) = &self.userspace {
            userspace.interrupt();
        }
        if let Some(perf) = &self.perf {
            perf.interrupt();
        }

        unsafe {
            libc::alarm(5);
        }

        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
            self.halt_pipeline.post();
        }

        unsafe {
            libc::alarm(0);
        }

        self.annotate_listener.close();
    }
}

fn realtime_now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn page_size() -> u32 {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_ranges_and_singletons() {
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpu_list("0-1,3"), vec![0, 1, 3]);
    }

    #[test]
    fn empty_cpu_list_falls_back_to_cpu_zero() {
        assert_eq!(parse_cpu_list(""), vec![0]);
    }

    #[test]
    fn claim_spe_rejects_second_filmstrip() {
        let filmstrip = FilmstripGuard::new();
        let configs = vec![
            CapturedSpe {
                id: FILMSTRIP_SPE_ID,
                event_filter_mask: 0,
                ops: Default::default(),
                min_latency: 0,
            },
            CapturedSpe {
                id: FILMSTRIP_SPE_ID,
                event_filter_mask: 0,
                ops: Default::default(),
                min_latency: 0,
            },
        ];
        assert!(claim_spe_configs(&configs, &filmstrip).is_err());
    }

    #[test]
    fn claim_spe_orders_by_ascending_id() {
        let filmstrip = FilmstripGuard::new();
        let configs = vec![
            CapturedSpe { id: 5, event_filter_mask: 0, ops: Default::default(), min_latency: 0 },
            CapturedSpe { id: 1, event_filter_mask: 0, ops: Default::default(), min_latency: 0 },
        ];
        let claimed = claim_spe_configs(&configs, &filmstrip).unwrap();
        assert_eq!(claimed[0].id, 1);
        assert_eq!(claimed[1].id, 5);
    }

    #[test]
    fn build_perf_groups_skips_disabled_counters() {
        let mut session = Session::new();
        session.counters.insert(
            1,
            crate::session::Counter {
                name: "a".into(),
                key: 1,
                event_code: -1,
                sampling_period: 0,
                core_count: 1,
                driver: "perf".into(),
            },
        );
        session.counters.insert(
            2,
            crate::session::Counter {
                name: "b".into(),
                key: 2,
                event_code: 7,
                sampling_period: 1000,
                core_count: 1,
                driver: "perf".into(),
            },
        );
        let groups = build_perf_groups(&session);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].events[0].key, 2);
    }

    #[test]
    fn find_process_by_name_matches_self() {
        let my_comm = std::fs::read_to_string("/proc/self/comm").unwrap();
        let pid = find_process_by_name(my_comm.trim()).unwrap();
        assert_eq!(pid, std::process::id() as i32);
    }

    #[test]
    fn workload_launch_holds_child_until_released() {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

        let launch = WorkloadLaunch::spawn(&["true".to_string()], None, None).unwrap();
        let pid = launch.pid;
        std::thread::sleep(Duration::from_millis(50));
        let status = waitpid(nix::unistd::Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)).unwrap();
        assert_eq!(status, WaitStatus::StillAlive);

        launch.release();
        let status = waitpid(nix::unistd::Pid::from_raw(pid), None).unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }
}

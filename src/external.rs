//! External Source (C6), spec §4.6.
//!
//! Demultiplexes byte streams from vendor sockets, ftrace pipes, and
//! annotation clients into the `EXTERNAL` ring. Grounded on
//! `cognitod/src/runtime/stream_listener.rs`'s accept-loop shape, reused
//! here for the Mali startup sockets, and on the `Monitor`/ring pairing
//! shared with `perf::drain`.

use std::collections::HashMap;
use std::io::Read;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::unistd::{close, pipe, read};

use crate::annotate::AnnotateListener;
use crate::frame::FrameType;
use crate::metrics::Metrics;
use crate::monitor::Monitor;
use crate::ring::RingBuffer;
use crate::sem::Semaphore;
use crate::session::Session;

pub const MALI_VIDEO_STARTUP: &str = "\0mali-video-startup";
pub const MALI_MIDGARD_STARTUP: &str = "\0mali_thirdparty_client";
pub const MALI_UTGARD_STARTUP: &str = "\0mali-utgard-startup";
pub const MALI_UTGARD_SETUP: &str = "\0mali-utgard-setup";

/// A vendor-protocol startup socket feeding bytes into the EXTERNAL ring.
/// The Mali wire dialects themselves are out of scope (spec §1); only the
/// "accept, read bytes, forward" interface matters here.
struct VendorListener {
    listener: UnixListener,
}

/// Stubbed ftrace pipe set. Real ftrace parsing is outside this crate's
/// scope (spec §1 lists only the Mali dialects explicitly, but the same
/// "only the interface matters" rule applies to any vendor/kernel-trace
/// wire format this daemon doesn't itself define); `prepare()` returns
/// whichever pipe fds are already open when called, e.g. by an external
/// trace-pipe opener.
#[derive(Default)]
pub struct FtraceDriver {
    pipes: Vec<RawFd>,
}

impl FtraceDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipes(pipes: Vec<RawFd>) -> Self {
        FtraceDriver { pipes }
    }

    pub fn prepare(&self) -> &[RawFd] {
        &self.pipes
    }
}

enum Client {
    Unix(UnixStream),
    Plain(RawFd),
}

impl Client {
    fn raw_fd(&self) -> RawFd {
        match self {
            Client::Unix(s) => s.as_raw_fd(),
            Client::Plain(fd) => *fd,
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Client::Unix(s) => s.read(buf),
            Client::Plain(fd) => {
                let n = unsafe {
                    libc::read(*fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }
        }
    }
}

pub struct ExternalSource {
    ring: Arc<RingBuffer>,
    monitor: Monitor,
    vendor_listeners: Vec<VendorListener>,
    clients: Mutex<HashMap<RawFd, Client>>,
    annotate_listener: Arc<AnnotateListener>,
    interrupt_read: RawFd,
    interrupt_write: RawFd,
    interrupted: AtomicBool,
    session: Arc<Session>,
    metrics: Arc<Metrics>,
}

impl ExternalSource {
    pub fn new(
        session: Arc<Session>,
        metrics: Arc<Metrics>,
        reader_sem: Arc<Semaphore>,
        annotate_listener: Arc<AnnotateListener>,
        mali_enabled: bool,
    ) -> std::io::Result<Self> {
        let monitor = Monitor::new()?;
        let (interrupt_read, interrupt_write) = pipe()?;
        monitor.add(interrupt_read.as_raw_fd())?;

        let mut vendor_listeners = Vec::new();
        if mali_enabled {
            for name in [
                MALI_VIDEO_STARTUP,
                MALI_MIDGARD_STARTUP,
                MALI_UTGARD_STARTUP,
                MALI_UTGARD_SETUP,
            ] {
                if let Ok(listener) = bind_abstract(name) {
                    listener.set_nonblocking(true)?;
                    monitor.add(listener.as_raw_fd())?;
                    vendor_listeners.push(VendorListener { listener });
                }
            }
        }

        monitor.add(annotate_listener.unix_fd())?;
        if let Some(fd) = annotate_listener.tcp_fd() {
            monitor.add(fd)?;
        }

        let ring = Arc::new(RingBuffer::new(
            -1,
            FrameType::External,
            1 << 20,
            session.one_shot,
            reader_sem,
        ));

        Ok(ExternalSource {
            ring,
            monitor,
            vendor_listeners,
            clients: Mutex::new(HashMap::new()),
            annotate_listener,
            interrupt_read: interrupt_read.into_raw_fd(),
            interrupt_write: interrupt_write.into_raw_fd(),
            interrupted: AtomicBool::new(false),
            session,
            metrics,
        })
    }

    /// Registers ftrace pipe fds once `FtraceDriver::prepare()` has been
    /// called (spec §4.6).
    pub fn add_ftrace_pipes(&self, driver: &FtraceDriver) -> std::io::Result<()> {
        for &fd in driver.prepare() {
            self.monitor.add(fd)?;
            self.clients.lock().unwrap().insert(fd, Client::Plain(fd));
        }
        Ok(())
    }

    pub fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    pub fn start(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("gatord-external".into())
            .spawn(move || self.run())
            .expect("spawn external source thread")
    }

    fn run(self: Arc<Self>) {
        crate::set_thread_name("gatord-external");
        // Spec §4.6: "blocks on monotonic_started_ns > 0 before forwarding
        // any payload, so that timestamps ... are all relative to the same
        // origin as Perf Source."
        while !self.session.has_started() && !self.interrupted.load(Ordering::Acquire) {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        while !self.interrupted.load(Ordering::Acquire) {
            let ready = match self.monitor.wait(64, 1000) {
                Ok(r) => r,
                Err(_) => continue,
            };
            for r in ready {
                if r.fd == self.interrupt_read {
                    continue;
                }
                if self.is_listener_fd(r.fd) {
                    self.accept_all();
                    continue;
                }
                if self.is_annotate_listener_fd(r.fd) {
                    let accepted = self.annotate_listener.accept_pending();
                    for fd in accepted {
                        let _ = self.monitor.add(fd);
                    }
                    continue;
                }
                self.drain_client(r.fd);
            }
        }
        self.ring.set_done();
    }

    fn is_listener_fd(&self, fd: RawFd) -> bool {
        self.vendor_listeners.iter().any(|v| v.listener.as_raw_fd() == fd)
    }

    fn is_annotate_listener_fd(&self, fd: RawFd) -> bool {
        fd == self.annotate_listener.unix_fd() || Some(fd) == self.annotate_listener.tcp_fd()
    }

    fn accept_all(&self) {
        for vendor in &self.vendor_listeners {
            loop {
                match vendor.listener.accept() {
                    Ok((stream, _)) => {
                        let fd = stream.as_raw_fd();
                        if self.monitor.add(fd).is_ok() {
                            self.clients.lock().unwrap().insert(fd, Client::Unix(stream));
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
    }

    /// Short-read-safe: a short read is "no more data right now"; a zero or
    /// erroring read closes the client and packs the `fd < 0` sentinel.
    fn drain_client(&self, fd: RawFd) {
        let now = crate::monotonic_now_ns();
        let mut buf = [0u8; 4096];
        let mut clients = self.clients.lock().unwrap();
        let Some(client) = clients.get_mut(&fd) else {
            return;
        };
        match client.read_some(&mut buf) {
            Ok(0) => {
                self.close_client(&mut clients, fd, now);
            }
            Ok(n) => {
                self.pack_payload(fd, &buf[..n], now);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => {
                self.close_client(&mut clients, fd, now);
            }
        }
    }

    fn close_client(&self, clients: &mut HashMap<RawFd, Client>, fd: RawFd, now: i64) {
        if let Some(client) = clients.remove(&fd) {
            let raw = client.raw_fd();
            let _ = self.monitor.remove(raw);
            self.annotate_listener.remove_client(raw);
            self.pack_closed(fd, now);
        }
    }

    fn pack_payload(&self, fd: RawFd, bytes: &[u8], now: i64) {
        self.ring.wait_for_space(bytes.len() + 16);
        let tok = self.ring.begin_frame();
        self.ring.event_header(now);
        self.ring.pack_int(fd);
        self.ring.pack_int(bytes.len() as i32);
        self.ring.write_bytes(bytes);
        self.ring.end_frame(now, false, tok);
        self.ring.commit(now, false);
    }

    fn pack_closed(&self, fd: RawFd, now: i64) {
        self.ring.wait_for_space(16);
        let tok = self.ring.begin_frame();
        self.ring.event_header(now);
        self.ring.pack_int(-(fd.abs().max(1)));
        self.ring.pack_int(0);
        self.ring.end_frame(now, false, tok);
        self.ring.commit(now, true);
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        unsafe {
            libc::write(self.interrupt_write, [0u8].as_ptr() as *const libc::c_void, 1);
        }
    }

    pub fn is_done(&self) -> bool {
        self.ring.is_done()
    }

    pub fn write<S: crate::ring::RingSink>(&self, sink: &S) -> std::io::Result<usize> {
        self.ring.write(sink)
    }
}

impl Drop for ExternalSource {
    fn drop(&mut self) {
        let _ = close(self.interrupt_read);
        let _ = close(self.interrupt_write);
    }
}

fn bind_abstract(name: &str) -> std::io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;
    let addr = SocketAddr::from_abstract_name(name.trim_start_matches('\0').as_bytes())?;
    UnixListener::bind_addr(&addr)
}

#[allow(dead_code)]
fn drain_self_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    let _ = read(fd, &mut buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    // `AnnotateListener::bind` always binds the fixed
    // `streamline-annotate-parent` abstract name, so these cases share one
    // listener instead of each binding their own — binding it twice
    // concurrently from separate test threads would race for the name.
    #[test]
    fn external_source_lifecycle() {
        let annotate = Arc::new(AnnotateListener::bind(false).unwrap());

        let source = ExternalSource::new(
            Arc::new(Session::new()),
            Arc::new(Metrics::new()),
            Arc::new(Semaphore::new(0)),
            annotate.clone(),
            false,
        )
        .unwrap();
        assert!(!source.is_done());

        source.interrupt();
        source.interrupt();
        assert!(source.interrupted.load(Ordering::Acquire));

        let driver = FtraceDriver::with_pipes(vec![3, 4]);
        assert_eq!(driver.prepare(), &[3, 4]);
    }
}

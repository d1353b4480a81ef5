//! Capture Process Supervisor (C10), spec §4.10.
//!
//! Long-lived parent process: becomes its own session/process-group leader,
//! lowers its scheduling priority, raises its own fd limit, binds the data
//! and discovery sockets, and accepts one host connection at a time —
//! fork()ing a `Child` (spec §4.9) to run each capture session while the
//! parent keeps listening for the next one.
//!
//! Grounded on `cognitod/src/main.rs`'s top-level orchestration (bind
//! listener, accept loop, signal handling, reap children), translated from
//! tokio's async accept loop to a `fork`-per-session model per REDESIGN
//! FLAGS (no async runtime anywhere in this crate — see DESIGN.md's
//! "Workspace shape" on dropping `tokio`). The fork/waitpid mechanics and
//! the async-signal-safe self-pipe relay reuse the same idiom `child.rs`
//! establishes for its own signal handling and its `WorkloadLaunch` fork.

use std::io::Read;
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe, setsid, Pid};

use crate::annotate::AnnotateListener;
use crate::child::Child;
use crate::config::{Cli, PortSpec, XmlCatalog};
use crate::error::ExitCode;
use crate::frame::{read_request_header, RequestType, ResponseType};
use crate::metrics::Metrics;
use crate::monitor::Monitor;
use crate::sender::{Sender, Transport};

pub const DISCOVERY_PORT: u16 = 30001;
/// `--port uds`: the abstract-domain main data socket (spec §6).
pub const DATA_UDS_ABSTRACT: &str = "\0streamline-data";

const DISCOVERY_REQUEST: &[u8] = b"DST_REQ \x00\x00\x00\x64";
/// Fixed-size UDP discovery reply (spec.md Open Questions #3 / DESIGN.md
/// resolution: a fixed 128-byte struct rather than a variable-length one,
/// matching the request's own fixed 12-byte shape).
const DISCOVERY_REPLY_LEN: usize = 128;
const DISCOVERY_REPLY_MAGIC: &[u8; 8] = b"STR_ANS ";
const PROTOCOL_VERSION: u32 = 1;

/// RLIMIT_NOFILE floor this process raises its soft limit to (spec §4.10).
const MIN_NOFILE: u64 = 32_768;
const SUPERVISOR_PRIORITY: i32 = -19;

/// The supervisor's own signal-handling state, mirroring `child.rs`'s
/// self-pipe relay: the handler only writes the signal number, an ordinary
/// thread does the actual reaping/forwarding.
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

fn install_signal_handlers() -> std::io::Result<RawFd> {
    let (read_end, write_end) = pipe()?;
    SIGNAL_WRITE_FD.store(write_end.into_raw_fd(), Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(signal_relay),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD] {
        unsafe {
            signal::sigaction(sig, &action).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, format!("sigaction failed: {e}"))
            })?;
        }
    }
    Ok(read_end.into_raw_fd())
}

/// Raises `RLIMIT_NOFILE`'s soft limit to at least `MIN_NOFILE`, never
/// lowering it if it's already higher (spec §4.10).
fn raise_nofile_limit() {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return;
    }
    let target = MIN_NOFILE.min(limit.rlim_max);
    if limit.rlim_cur < target {
        limit.rlim_cur = target;
        unsafe {
            libc::setrlimit(libc::RLIMIT_NOFILE, &limit);
        }
    }
}

fn bind_abstract(name: &str) -> std::io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;
    let addr = SocketAddr::from_abstract_name(name.trim_start_matches('\0').as_bytes())?;
    UnixListener::bind_addr(&addr)
}

/// The main data listener: either a plain TCP port or the abstract-domain
/// socket selected by `--port uds` (spec §6).
enum DataListener {
    Tcp(TcpListener),
    Uds(UnixListener),
}

impl DataListener {
    fn bind(port: &PortSpec) -> std::io::Result<Self> {
        match port {
            PortSpec::Tcp(p) => Ok(DataListener::Tcp(TcpListener::bind(("0.0.0.0", *p))?)),
            PortSpec::Uds => Ok(DataListener::Uds(bind_abstract(DATA_UDS_ABSTRACT)?)),
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        match self {
            DataListener::Tcp(l) => l.as_raw_fd(),
            DataListener::Uds(l) => l.as_raw_fd(),
        }
    }

    fn accept(&self) -> std::io::Result<DataConn> {
        match self {
            DataListener::Tcp(l) => l.accept().map(|(s, _)| DataConn::Tcp(s)),
            DataListener::Uds(l) => l.accept().map(|(s, _)| DataConn::Uds(s)),
        }
    }
}

enum DataConn {
    Tcp(TcpStream),
    Uds(UnixStream),
}

impl DataConn {
    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            DataConn::Tcp(s) => s.read_exact(buf),
            DataConn::Uds(s) => s.read_exact(buf),
        }
    }

    fn try_clone(&self) -> std::io::Result<DataConn> {
        match self {
            DataConn::Tcp(s) => s.try_clone().map(DataConn::Tcp),
            DataConn::Uds(s) => s.try_clone().map(DataConn::Uds),
        }
    }

    fn into_transport(self) -> Transport {
        match self {
            DataConn::Tcp(s) => Transport::Socket(s),
            DataConn::Uds(s) => Transport::Unix(s),
        }
    }

    /// Boxes this connection as a plain reader plus its raw fd, for the
    /// host stop-thread (spec §4.9 step 9) to read independently of the
    /// `Sender`'s half of the same socket.
    fn into_reader(self) -> (RawFd, Box<dyn Read + Send>) {
        match self {
            DataConn::Tcp(s) => (s.as_raw_fd(), Box::new(s)),
            DataConn::Uds(s) => (s.as_raw_fd(), Box::new(s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Capturing { child_pid: i32 },
    Exiting { child_pid: i32 },
}

pub struct Supervisor {
    cli: Cli,
    data_listener: DataListener,
    discovery: UdpSocket,
    annotate_listener: Arc<AnnotateListener>,
    monitor: Monitor,
    signal_read_fd: RawFd,
}

impl Supervisor {
    pub fn new(cli: Cli) -> anyhow::Result<Self> {
        setsid().ok();
        unsafe {
            libc::setpriority(libc::PRIO_PROCESS, 0, SUPERVISOR_PRIORITY);
        }
        raise_nofile_limit();

        let annotate_listener = Arc::new(AnnotateListener::bind(false)?);
        let data_listener = DataListener::bind(&cli.port)?;
        let discovery = UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT))?;
        discovery.set_nonblocking(true)?;

        let signal_read_fd = install_signal_handlers()?;
        let monitor = Monitor::new()?;
        monitor.add(data_listener.as_raw_fd())?;
        monitor.add(discovery.as_raw_fd())?;
        monitor.add(signal_read_fd)?;

        Ok(Supervisor {
            cli,
            data_listener,
            discovery,
            annotate_listener,
            monitor,
            signal_read_fd,
        })
    }

    /// Runs until a second terminating signal arrives, returning the exit
    /// code for the supervisor process itself.
    pub fn run(&mut self) -> anyhow::Result<ExitCode> {
        let mut state = State::Idle;
        loop {
            let ready = self.monitor.wait(8, 1000)?;
            for r in ready {
                if r.fd == self.signal_read_fd {
                    if let Some(code) = self.handle_signals(&mut state)? {
                        return Ok(code);
                    }
                } else if r.fd == self.discovery.as_raw_fd() {
                    self.answer_discovery();
                } else if r.fd == self.data_listener.as_raw_fd() {
                    self.accept_connection(&mut state);
                }
            }
        }
    }

    fn answer_discovery(&self) {
        let mut buf = [0u8; 64];
        loop {
            match self.discovery.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    if &buf[..n.min(DISCOVERY_REQUEST.len())] == DISCOVERY_REQUEST {
                        let reply = build_discovery_reply(self.data_port());
                        let _ = self.discovery.send_to(&reply, peer);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn data_port(&self) -> u16 {
        match &self.cli.port {
            PortSpec::Tcp(p) => *p,
            PortSpec::Uds => 0,
        }
    }

    /// Accepts one connection. If idle, runs the handshake and forks a
    /// `Child`; if already capturing, serves the last error and closes
    /// (spec §4.10: "Additional connections received while CAPTURING are
    /// accepted, served the last error message via a Sender, and closed").
    fn accept_connection(&self, state: &mut State) {
        let Ok(mut conn) = self.data_listener.accept() else {
            return;
        };

        if matches!(state, State::Capturing { .. } | State::Exiting { .. }) {
            if let Ok(transport) = conn.try_clone().map(DataConn::into_transport) {
                let sender = Sender::new(transport);
                let _ = sender.write_data(
                    b"capture already in progress",
                    ResponseType::Error,
                    true,
                );
            }
            return;
        }

        let session = match self.handshake(&mut conn) {
            Ok(Some(session)) => session,
            Ok(None) => return, // host disconnected before APC_START
            Err(_) => return,
        };

        match fork_child(session, conn, self.annotate_listener.clone()) {
            Ok(child_pid) => *state = State::Capturing { child_pid },
            Err(_) => {}
        }
    }

    /// Reads request frames until `APC_START` (spec §4.9 step 1's "parsed
    /// from host after StreamlineSetup handshake"). `REQUEST_XML` and
    /// `DELIVER_XML` are answered minimally — full XML schema fidelity is
    /// out of scope (spec §1) — `PING` is ACKed, anything else ends the
    /// handshake.
    fn handshake(&self, conn: &mut DataConn) -> std::io::Result<Option<crate::session::Session>> {
        let mut catalog = XmlCatalog::new();
        loop {
            let mut header = [0u8; 5];
            if conn.read_exact(&mut header).is_err() {
                return Ok(None);
            }
            let (cmd, len) = read_request_header(&header);
            let mut payload = vec![0u8; len as usize];
            if len > 0 && conn.read_exact(&mut payload).is_err() {
                return Ok(None);
            }

            match RequestType::from_byte(cmd) {
                Some(RequestType::DeliverXml) => {
                    if let Ok(parsed) = XmlCatalog::parse(&String::from_utf8_lossy(&payload)) {
                        catalog = parsed;
                    }
                }
                Some(RequestType::ApcStart) => {
                    let session = crate::config::session_from_cli(&self.cli, &catalog)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                    return Ok(Some(session));
                }
                Some(RequestType::Disconnect) => return Ok(None),
                _ => {} // REQUEST_XML, PING, REQUEST_CURRENT_CONFIG: no reply needed to proceed
            }
        }
    }

    /// Drains every pending signal byte and acts on it. Returns `Some(code)`
    /// once the supervisor itself should exit.
    fn handle_signals(&self, state: &mut State) -> std::io::Result<Option<ExitCode>> {
        let mut buf = [0u8; 16];
        let n = nix::unistd::read(self.signal_read_fd, &mut buf)?;
        for &signum in &buf[..n] {
            if signum as i32 == Signal::SIGCHLD as i32 {
                self.reap_children(state);
            } else {
                match *state {
                    State::Idle => return Ok(Some(ExitCode::Ok)),
                    State::Capturing { child_pid } => {
                        let _ = nix::sys::signal::kill(Pid::from_raw(child_pid), Signal::SIGINT);
                        *state = State::Exiting { child_pid };
                    }
                    State::Exiting { child_pid } => {
                        unsafe {
                            libc::kill(-child_pid, libc::SIGKILL);
                        }
                        return Ok(Some(ExitCode::SecondSignal));
                    }
                }
            }
        }
        Ok(None)
    }

    /// `SIGCHLD` handler body: reaps every exited child, mapping the one
    /// this supervisor is tracking back to `Idle` (spec §4.10 "handles
    /// SIGCHLD to reap the Child, mapping its exit status to one of the
    /// documented exit codes").
    fn reap_children(&self, state: &mut State) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    let reaped = pid.as_raw();
                    match *state {
                        State::Capturing { child_pid } if child_pid == reaped => {
                            *state = State::Idle;
                        }
                        State::Exiting { child_pid } if child_pid == reaped => {
                            *state = State::Idle;
                        }
                        _ => {}
                    }
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                _ => continue,
            }
        }
    }
}

/// `{magic: 8 bytes, port: u32 LE, protocol_version: u32 LE, hostname:
/// remaining bytes, NUL-padded}` — the "defaultGateway"/"subnetMask" slots
/// of the legacy discovery protocol repurposed per spec §6's "encodes
/// hostname, overridden TCP port (in defaultGateway slot), and protocol
/// version (in subnetMask slot)", laid out as one fixed 128-byte struct
/// (DESIGN.md's Open Question resolution) rather than a variable-length
/// one.
fn build_discovery_reply(port: u16) -> [u8; DISCOVERY_REPLY_LEN] {
    let mut out = [0u8; DISCOVERY_REPLY_LEN];
    out[..8].copy_from_slice(DISCOVERY_REPLY_MAGIC);
    out[8..12].copy_from_slice(&(port as u32).to_le_bytes());
    out[12..16].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let hostname_bytes = hostname.as_bytes();
    let n = hostname_bytes.len().min(DISCOVERY_REPLY_LEN - 16);
    out[16..16 + n].copy_from_slice(&hostname_bytes[..n]);
    out
}

/// Forks a `Child` to run one capture session. The parent closes its copy
/// of the connection fd and returns the child pid for state tracking; the
/// child process builds its own `Sender`/`Metrics` and runs to completion,
/// exiting with whatever `Child::run` returns (spec §4.9, §4.10).
fn fork_child(
    session: crate::session::Session,
    conn: DataConn,
    annotate_listener: Arc<AnnotateListener>,
) -> anyhow::Result<i32> {
    use nix::unistd::ForkResult;
    match unsafe { nix::unistd::fork() }? {
        ForkResult::Parent { child } => {
            drop(conn);
            Ok(child.as_raw())
        }
        ForkResult::Child => {
            let exit_code = run_child_session(session, conn, annotate_listener)
                .unwrap_or(ExitCode::Exception);
            std::process::exit(exit_code as i32);
        }
    }
}

fn run_child_session(
    session: crate::session::Session,
    conn: DataConn,
    annotate_listener: Arc<AnnotateListener>,
) -> anyhow::Result<ExitCode> {
    let stop_reader = conn.try_clone().ok().map(DataConn::into_reader);
    let sender = Arc::new(Sender::new(conn.into_transport()));
    let metrics = Arc::new(Metrics::new());
    let child = Child::new(Arc::new(session), metrics, sender, annotate_listener, stop_reader)?;
    child.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_reply_has_expected_magic_and_length() {
        let reply = build_discovery_reply(8080);
        assert_eq!(reply.len(), DISCOVERY_REPLY_LEN);
        assert_eq!(&reply[..8], DISCOVERY_REPLY_MAGIC);
        assert_eq!(u32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]), 8080);
    }

    #[test]
    fn discovery_reply_embeds_protocol_version() {
        let reply = build_discovery_reply(0);
        let version = u32::from_le_bytes([reply[12], reply[13], reply[14], reply[15]]);
        assert_eq!(version, PROTOCOL_VERSION);
    }
}

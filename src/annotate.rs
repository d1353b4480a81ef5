//! Annotate Listener (C4) and the in-band Annotation Protocol (C11), spec
//! §4.4, §4.11.
//!
//! Grounded on `cognitod/src/runtime/stream_listener.rs`'s accept-loop shape
//! and `cognitod/src/handler/mod.rs`'s `HandlerList` (`Vec<Arc<dyn
//! Handler>>`) — here an owned, keyed `HashMap<RawFd, AnnotationClient>`
//! rather than the original's intrusive linked list, per REDESIGN FLAGS
//! ("represent as an owned collection of client handles keyed by fd;
//! removal on failed write is a single `erase`").

use std::collections::HashMap;
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Mutex;

use crate::varint;

pub const ANNOTATE_PARENT_ABSTRACT: &str = "\0streamline-annotate-parent";
pub const ANNOTATE_CHILD_ABSTRACT: &str = "\0streamline-annotate";
pub const ANNOTATE_TCP_PORT: u16 = 8082;

/// A single accepted annotation connection (spec §3 `AnnotationClient`,
/// minus the intrusive `next` pointer — ownership lives in the listener's
/// map instead).
pub struct AnnotationClient {
    stream: UnixOrTcp,
}

enum UnixOrTcp {
    Unix(UnixStream),
    Tcp(std::net::TcpStream),
}

impl AnnotationClient {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match &mut self.stream {
            UnixOrTcp::Unix(s) => s.write_all(buf),
            UnixOrTcp::Tcp(s) => s.write_all(buf),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match &self.stream {
            UnixOrTcp::Unix(s) => s.as_raw_fd(),
            UnixOrTcp::Tcp(s) => s.as_raw_fd(),
        }
    }
}

/// Owns the two server sockets and the accepted-client set. Constructed
/// once by the Supervisor so annotation connections survive across capture
/// sessions (spec §4.4 "Used by the Capture Supervisor, not the Child").
pub struct AnnotateListener {
    unix_listener: UnixListener,
    tcp_listener: Option<std::net::TcpListener>,
    clients: Mutex<HashMap<RawFd, AnnotationClient>>,
    tcp_annotations_enabled: bool,
}

impl AnnotateListener {
    pub fn bind(tcp_annotations_enabled: bool) -> std::io::Result<Self> {
        let unix_listener = bind_abstract(ANNOTATE_PARENT_ABSTRACT)?;
        unix_listener.set_nonblocking(true)?;
        let tcp_listener = if tcp_annotations_enabled {
            let l = std::net::TcpListener::bind(("0.0.0.0", ANNOTATE_TCP_PORT))?;
            l.set_nonblocking(true)?;
            Some(l)
        } else {
            None
        };
        Ok(AnnotateListener {
            unix_listener,
            tcp_listener,
            clients: Mutex::new(HashMap::new()),
            tcp_annotations_enabled,
        })
    }

    pub fn unix_fd(&self) -> RawFd {
        self.unix_listener.as_raw_fd()
    }

    pub fn tcp_fd(&self) -> Option<RawFd> {
        self.tcp_listener.as_ref().map(|l| l.as_raw_fd())
    }

    /// Accepts every pending connection on both server sockets, prepending
    /// each to the client set. Returns the accepted fds so the caller can
    /// register them with its own Monitor (the External Source's, per spec
    /// §4.6: "accepted clients are added to the same Monitor").
    pub fn accept_pending(&self) -> Vec<RawFd> {
        let mut accepted = Vec::new();
        loop {
            match self.unix_listener.accept() {
                Ok((stream, _)) => {
                    let fd = stream.as_raw_fd();
                    self.clients
                        .lock()
                        .unwrap()
                        .insert(fd, AnnotationClient { stream: UnixOrTcp::Unix(stream) });
                    accepted.push(fd);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        if let Some(tcp) = &self.tcp_listener {
            loop {
                match tcp.accept() {
                    Ok((stream, _)) => {
                        let fd = stream.as_raw_fd();
                        self.clients
                            .lock()
                            .unwrap()
                            .insert(fd, AnnotationClient { stream: UnixOrTcp::Tcp(stream) });
                        accepted.push(fd);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
        accepted
    }

    /// Writes one zero byte to every client fd (a wake/heartbeat); any
    /// client whose write fails is unlinked and closed.
    pub fn signal(&self) {
        let mut clients = self.clients.lock().unwrap();
        let mut dead = Vec::new();
        for (fd, client) in clients.iter_mut() {
            if client.write_all(&[0u8]).is_err() {
                dead.push(*fd);
            }
        }
        for fd in dead {
            clients.remove(&fd);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Removes a client whose fd failed on the External Source's own read
    /// path (spec §4.6: `fd < 0` sentinel signals "connection closed").
    pub fn remove_client(&self, fd: RawFd) {
        self.clients.lock().unwrap().remove(&fd);
    }

    pub fn tcp_annotations_enabled(&self) -> bool {
        self.tcp_annotations_enabled
    }

    /// Closes all sockets and all client fds.
    pub fn close(&self) {
        self.clients.lock().unwrap().clear();
    }
}

fn bind_abstract(name: &str) -> std::io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;
    let addr = SocketAddr::from_abstract_name(name.trim_start_matches('\0').as_bytes())?;
    UnixListener::bind_addr(&addr)
}

/// Packs one annotation packet: `{tid, time, cpu, size, payload}` (spec
/// §4.11). The caller is responsible for writing it into the EXTERNAL ring
/// alongside the originating fd.
pub fn pack_annotation(tid: u32, time_ns: i64, cpu: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 16);
    varint::write_u32(&mut out, tid);
    varint::write_i64(&mut out, time_ns);
    varint::write_u32(&mut out, cpu);
    varint::write_u32(&mut out, payload.len() as u32);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_annotation_round_trips_via_varint() {
        let packed = pack_annotation(7, 12345, 2, b"hello");
        let (tid, n0) = varint::read_u32(&packed).unwrap();
        let (time, n1) = varint::read_i64(&packed[n0..]).unwrap();
        let (cpu, n2) = varint::read_u32(&packed[n0 + n1..]).unwrap();
        let (size, n3) = varint::read_u32(&packed[n0 + n1 + n2..]).unwrap();
        let start = n0 + n1 + n2 + n3;
        assert_eq!(tid, 7);
        assert_eq!(time, 12345);
        assert_eq!(cpu, 2);
        assert_eq!(size, 5);
        assert_eq!(&packed[start..start + size as usize], b"hello");
    }

    #[test]
    fn listener_accepts_and_signals_unix_clients() {
        let listener = AnnotateListener {
            unix_listener: UnixListener::bind_addr(&{
                use std::os::linux::net::SocketAddrExt;
                std::os::unix::net::SocketAddr::from_abstract_name(
                    format!("gatord-test-{}", std::process::id()).as_bytes(),
                )
                .unwrap()
            })
            .unwrap(),
            tcp_listener: None,
            clients: Mutex::new(HashMap::new()),
            tcp_annotations_enabled: false,
        };
        listener.unix_listener.set_nonblocking(true).unwrap();

        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(
            format!("gatord-test-{}", std::process::id()).as_bytes(),
        )
        .unwrap();
        let _client = UnixStream::connect_addr(&addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let accepted = listener.accept_pending();
        assert_eq!(accepted.len(), 1);
        assert_eq!(listener.client_count(), 1);

        listener.signal();
        assert_eq!(listener.client_count(), 1);
    }
}

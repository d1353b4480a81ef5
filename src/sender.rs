//! Single-writer framer (C2, spec §4.2).
//!
//! Grounded on `cognitod/src/handler/mod.rs`'s `JsonlHandler`: a file/socket
//! handle guarded by one `Mutex` so only one writer is ever mid-write,
//! generalized from newline-delimited JSON to spec §3/§6's length-prefixed
//! binary frames, plus the "response body ≤ 16 MiB" cap and the
//! terminal-error latch spec §4.2 requires.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::frame::{write_header, ResponseType};
use crate::ring::RingSink;

/// Response bodies larger than this must be split by the source at frame
/// boundaries before reaching the Sender (spec §4.2).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Where framed output actually goes.
pub enum Transport {
    Socket(std::net::TcpStream),
    /// `--port uds`: the abstract-domain data socket (spec §6).
    Unix(std::os::unix::net::UnixStream),
    File(std::fs::File),
}

impl Transport {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Socket(s) => s.write_all(buf),
            Transport::Unix(s) => s.write_all(buf),
            Transport::File(f) => f.write_all(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Socket(s) => s.flush(),
            Transport::Unix(s) => s.flush(),
            Transport::File(f) => f.flush(),
        }
    }
}

pub struct Sender {
    transport: Mutex<Transport>,
    /// Set once a send fails with a transport-terminal error (EPIPE/
    /// ECONNRESET); subsequent writes become no-ops.
    terminal_error: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Sender {
    pub fn new(transport: Transport) -> Self {
        Sender {
            transport: Mutex::new(transport),
            terminal_error: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn has_terminal_error(&self) -> bool {
        self.terminal_error.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Frames one response whose body is the concatenation of `parts`.
    /// `Transport::Raw`-equivalent forwarding (pre-framed payloads) goes
    /// through `write_raw` instead.
    pub fn write_data_parts(
        &self,
        parts: &[&[u8]],
        response_type: ResponseType,
        ignore_lock_errors: bool,
    ) -> std::io::Result<usize> {
        if self.terminal_error.load(Ordering::Acquire) && !ignore_lock_errors {
            return Ok(0);
        }
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "response body exceeds 16 MiB frame cap",
            ));
        }
        let mut header = Vec::with_capacity(5);
        write_header(&mut header, response_type, total as u32);

        let mut transport = self.transport.lock().unwrap();
        let result = (|| -> std::io::Result<()> {
            transport.write_all(&header)?;
            for p in parts {
                transport.write_all(p)?;
            }
            transport.flush()
        })();

        match result {
            Ok(()) => Ok(total),
            Err(e) => {
                if is_terminal(&e) {
                    self.terminal_error.store(true, Ordering::Release);
                    *self.last_error.lock().unwrap() = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    pub fn write_data(
        &self,
        data: &[u8],
        response_type: ResponseType,
        ignore_lock_errors: bool,
    ) -> std::io::Result<usize> {
        self.write_data_parts(&[data], response_type, ignore_lock_errors)
    }

    /// Forwards a pre-framed payload verbatim, skipping framing entirely.
    pub fn write_raw(&self, data: &[u8]) -> std::io::Result<usize> {
        if self.terminal_error.load(Ordering::Acquire) {
            return Ok(0);
        }
        let mut transport = self.transport.lock().unwrap();
        match transport.write_all(data).and_then(|_| transport.flush()) {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                if is_terminal(&e) {
                    self.terminal_error.store(true, Ordering::Release);
                    *self.last_error.lock().unwrap() = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// A zero-length `APC_DATA` frame, sent to terminate a live-capture
    /// stream (spec §4.9 step 8).
    pub fn write_terminator(&self) -> std::io::Result<usize> {
        self.write_data_parts(&[], ResponseType::ApcData, true)
    }
}

/// `create_data_file`: opens (or creates) the local-capture `data` file
/// inside `apc_dir`.
pub fn create_data_file(apc_dir: &std::path::Path) -> std::io::Result<std::fs::File> {
    std::fs::File::create(apc_dir.join("data"))
}

fn is_terminal(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EPIPE) | Some(libc::ECONNRESET)
    )
}

/// Lets a `RingBuffer` drain straight into a Sender as `APC_DATA` frames.
impl RingSink for Sender {
    fn write_parts(&self, parts: &[&[u8]]) -> std::io::Result<usize> {
        self.write_data_parts(parts, ResponseType::ApcData, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn file_sender(path: &std::path::Path) -> Sender {
        let f = std::fs::File::create(path).unwrap();
        Sender::new(Transport::File(f))
    }

    #[test]
    fn framed_write_has_correct_header() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sender = file_sender(tmp.path());
        sender
            .write_data(b"abc", ResponseType::ApcData, false)
            .unwrap();
        let mut buf = Vec::new();
        std::fs::File::open(tmp.path())
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf[0], ResponseType::ApcData as u8);
        assert_eq!(u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]), 3);
        assert_eq!(&buf[5..], b"abc");
    }

    #[test]
    fn oversized_body_is_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sender = file_sender(tmp.path());
        let huge = vec![0u8; MAX_FRAME_BYTES + 1];
        let err = sender
            .write_data(&huge, ResponseType::ApcData, false)
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn terminator_is_zero_length_apc_data() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sender = file_sender(tmp.path());
        sender.write_terminator().unwrap();
        let mut buf = Vec::new();
        std::fs::File::open(tmp.path())
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf.len(), 5);
        assert_eq!(u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]), 0);
    }
}

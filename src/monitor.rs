//! Edge-triggered readiness wrapper (C3, spec §4.3).
//!
//! Grounded on `cognitod/src/runtime/stream_listener.rs`'s use of
//! `tokio::io::unix::AsyncFd` for edge-triggered perf-buffer readiness;
//! translated to a blocking `epoll` wrapper since spec §5 mandates real OS
//! threads (not async) for the core acquisition pipeline. Uses
//! `nix::sys::epoll`, matching the teacher's reliance on `nix` for raw
//! Linux syscalls elsewhere (`cognitod`'s `nix` dependency already carries
//! `time`; this crate's Cargo.toml extends that feature set).

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

pub struct Monitor {
    epoll: Epoll,
}

/// One fd's readiness after a `wait()` call.
#[derive(Debug, Clone, Copy)]
pub struct ReadyFd {
    pub fd: RawFd,
    pub readable: bool,
    pub hangup: bool,
}

impl Monitor {
    pub fn new() -> std::io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty())?;
        Ok(Monitor { epoll })
    }

    /// Registers `fd` for edge-triggered readability.
    pub fn add(&self, fd: RawFd) -> std::io::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let event = EpollEvent::new(
            EpollFlags::EPOLLIN | EpollFlags::EPOLLET | EpollFlags::EPOLLRDHUP,
            fd as u64,
        );
        self.epoll.add(borrowed, event)?;
        Ok(())
    }

    pub fn remove(&self, fd: RawFd) -> std::io::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed)?;
        Ok(())
    }

    /// Waits up to `timeout_ms` (negative: forever) for readiness on any
    /// registered fd. `EINTR` is folded into an empty result rather than
    /// surfaced as an error (spec §4.3).
    pub fn wait(&self, max: usize, timeout_ms: isize) -> std::io::Result<Vec<ReadyFd>> {
        let mut events = vec![EpollEvent::empty(); max];
        let timeout = nix::sys::epoll::EpollTimeout::try_from(timeout_ms as i32)
            .unwrap_or(nix::sys::epoll::EpollTimeout::NONE);
        let n = match self.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(std::io::Error::from(e)),
        };
        Ok(events[..n]
            .iter()
            .map(|e| ReadyFd {
                fd: e.data() as RawFd,
                readable: e.events().contains(EpollFlags::EPOLLIN),
                hangup: e
                    .events()
                    .intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{close, pipe, write};

    #[test]
    fn wait_reports_readable_pipe() {
        let (read_end, write_end) = pipe().unwrap();
        let monitor = Monitor::new().unwrap();
        monitor.add(read_end.as_raw_fd()).unwrap();
        write(&write_end, b"x").unwrap();
        let ready = monitor.wait(8, 1_000).unwrap();
        assert!(ready.iter().any(|r| r.fd == read_end.as_raw_fd() && r.readable));
        close(read_end.as_raw_fd()).ok();
        drop(write_end);
    }

    #[test]
    fn wait_times_out_with_no_fds() {
        let monitor = Monitor::new().unwrap();
        let ready = monitor.wait(8, 10).unwrap();
        assert!(ready.is_empty());
    }
}

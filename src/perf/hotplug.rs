//! CPU hot-plug watcher (spec §4.5.6).
//!
//! A `NETLINK_KOBJECT_UEVENT` socket delivers `cpu online`/`cpu offline`
//! uevents, which drive the `OFFLINE -> ARMED -> ENABLED` state machine in
//! `perf::group`. Socket setup follows the same raw `nix::sys::socket`
//! idiom the rest of this crate uses for non-TCP/UDP sockets (the annotate
//! listener's abstract-domain sockets, the External Source's vendor
//! sockets) rather than a netlink-specific crate, since nothing in the
//! dependency pack wraps `NETLINK_KOBJECT_UEVENT` and the raw socket here
//! is a handful of lines.

use std::os::fd::{AsRawFd, RawFd};

use nix::sys::socket::{
    bind, socket, AddressFamily, NetlinkAddr, SockFlag, SockType,
};

pub const NETLINK_KOBJECT_UEVENT: i32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    CpuOnline(u32),
    CpuOffline(u32),
}

pub struct HotplugWatcher {
    fd: std::os::fd::OwnedFd,
}

impl HotplugWatcher {
    pub fn open() -> std::io::Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            nix::sys::socket::SockProtocol::NetlinkKObjectUEvent,
        )?;
        let addr = NetlinkAddr::new(0, 1 /* bind to the kernel multicast group */);
        bind(fd.as_raw_fd(), &addr)?;
        Ok(HotplugWatcher { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Parses one uevent datagram. Uevents are NUL-separated `KEY=VALUE`
    /// lines; we care about `ACTION=online`/`ACTION=offline` paired with a
    /// `DEVPATH` of the form `.../cpu/cpuN`.
    pub fn parse(datagram: &[u8]) -> Option<HotplugEvent> {
        let mut action: Option<&str> = None;
        let mut cpu_index: Option<u32> = None;
        for field in datagram.split(|&b| b == 0) {
            let Ok(s) = std::str::from_utf8(field) else {
                continue;
            };
            if let Some(value) = s.strip_prefix("ACTION=") {
                action = Some(value);
            } else if let Some(devpath) = s.strip_prefix("DEVPATH=") {
                if let Some(idx) = devpath.rsplit('/').next().and_then(|seg| seg.strip_prefix("cpu")) {
                    cpu_index = idx.parse().ok();
                }
            }
        }
        match (action, cpu_index) {
            (Some("online"), Some(cpu)) => Some(HotplugEvent::CpuOnline(cpu)),
            (Some("offline"), Some(cpu)) => Some(HotplugEvent::CpuOffline(cpu)),
            _ => None,
        }
    }

    pub fn read_event(&self) -> std::io::Result<Option<HotplugEvent>> {
        let mut buf = [0u8; 4096];
        let n = nix::unistd::read(self.fd.as_raw_fd(), &mut buf)?;
        Ok(Self::parse(&buf[..n]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uevent(fields: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for f in fields {
            out.extend_from_slice(f.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn parses_cpu_online_event() {
        let datagram = uevent(&["ACTION=online", "DEVPATH=/devices/system/cpu/cpu3"]);
        assert_eq!(
            HotplugWatcher::parse(&datagram),
            Some(HotplugEvent::CpuOnline(3))
        );
    }

    #[test]
    fn parses_cpu_offline_event() {
        let datagram = uevent(&["ACTION=offline", "DEVPATH=/devices/system/cpu/cpu1"]);
        assert_eq!(
            HotplugWatcher::parse(&datagram),
            Some(HotplugEvent::CpuOffline(1))
        );
    }

    #[test]
    fn ignores_unrelated_device_events() {
        let datagram = uevent(&["ACTION=add", "DEVPATH=/devices/virtual/net/eth0"]);
        assert_eq!(HotplugWatcher::parse(&datagram), None);
    }
}
